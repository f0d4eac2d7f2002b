//! Script Wrappers

use std::{cell::Cell, rc::Rc};

use bytes::Bytes;
use mlua::{Function, UserData, UserDataMethods};

use crate::{error::ScriptError, headers::SharedHeaderMap};

use super::LiveFlag;

/// Script-visible handle over a header map.
pub(crate) struct HeaderMapWrapper {
    map: SharedHeaderMap,
    live: LiveFlag,
    released: Option<Rc<Cell<bool>>>,
}

impl HeaderMapWrapper {
    pub(crate) fn new(map: SharedHeaderMap, live: LiveFlag) -> Self {
        Self {
            map,
            live,
            released: None,
        }
    }

    /// Wrapper for a map that is handed downstream at some point; once the
    /// release flag is set, mutation fails.
    pub(crate) fn with_release_flag(
        map: SharedHeaderMap,
        live: LiveFlag,
        released: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            map,
            live,
            released: Some(released),
        }
    }

    fn check_mutable(&self) -> mlua::Result<()> {
        if let Some(released) = &self.released {
            if released.get() {
                return Err(mlua::Error::external(ScriptError::HeadersReadOnly));
            }
        }
        Ok(())
    }
}

impl UserData for HeaderMapWrapper {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("add", |_, this, (name, value): (mlua::String, mlua::String)| {
            this.live.check()?;
            this.check_mutable()?;
            this.map
                .borrow_mut()
                .add(&name.as_bytes(), &value.as_bytes())
                .map_err(mlua::Error::external)?;
            Ok(())
        });

        methods.add_method("get", |lua, this, name: mlua::String| {
            this.live.check()?;
            match this.map.borrow().get(&name.as_bytes()) {
                Some(value) => Ok(Some(lua.create_string(&value)?)),
                None => Ok(None),
            }
        });

        methods.add_method("iterate", |lua, this, callback: Function| {
            this.live.check()?;
            // Snapshot so the callback may mutate the map while iterating.
            let entries = this.map.borrow().entries();
            for (name, value) in entries {
                let name = lua.create_string(&name)?;
                let value = lua.create_string(&value)?;
                // No pcall: a callback error aborts the whole invocation.
                callback.call::<()>((name, value))?;
            }
            Ok(())
        });

        methods.add_method("remove", |_, this, name: mlua::String| {
            this.live.check()?;
            this.check_mutable()?;
            this.map.borrow_mut().remove(&name.as_bytes());
            Ok(())
        });
    }
}

/// Script-visible handle over a read-only byte buffer.
pub(crate) struct BufferWrapper {
    data: Bytes,
    live: LiveFlag,
}

impl BufferWrapper {
    pub(crate) fn new(data: Bytes, live: LiveFlag) -> Self {
        Self { data, live }
    }
}

impl UserData for BufferWrapper {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("byteSize", |_, this, ()| {
            this.live.check()?;
            Ok(this.data.len())
        });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use mlua::Lua;

    use super::*;
    use crate::headers::{ByteHeaderMap, HeaderMap};

    fn shared(map: ByteHeaderMap) -> (Rc<RefCell<ByteHeaderMap>>, SharedHeaderMap) {
        let map = Rc::new(RefCell::new(map));
        let dynamic: SharedHeaderMap = map.clone();
        (map, dynamic)
    }

    fn live() -> LiveFlag {
        let flag = LiveFlag::new();
        flag.mark_live();
        flag
    }

    #[test]
    fn test_add_get_round_trip() {
        let lua = Lua::new();
        let (map, dynamic) = shared(ByteHeaderMap::new());
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, live()))
            .unwrap();

        lua.load(
            r#"
            function check(headers)
              headers:add("Foo", "bar")
              return headers:get("foo")
            end
            "#,
        )
        .exec()
        .unwrap();

        let check: Function = lua.globals().get("check").unwrap();
        let value: String = check.call(&wrapper).unwrap();
        assert_eq!(value, "bar");
        assert_eq!(map.borrow().get(b"foo"), Some(b"bar".to_vec()));
    }

    #[test]
    fn test_get_missing_is_nil() {
        let lua = Lua::new();
        let (_map, dynamic) = shared(ByteHeaderMap::new());
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, live()))
            .unwrap();

        let check = lua
            .load("return function(headers) return headers:get(\"nope\") == nil end")
            .eval::<Function>()
            .unwrap();
        let missing: bool = check.call(&wrapper).unwrap();
        assert!(missing);
    }

    #[test]
    fn test_iterate_in_map_order() {
        let lua = Lua::new();
        let mut map = ByteHeaderMap::new();
        map.append(":path", "/");
        map.append("foo", "bar");
        let (_map, dynamic) = shared(map);
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, live()))
            .unwrap();

        let collect = lua
            .load(
                r#"
                return function(headers)
                  local seen = ""
                  headers:iterate(function(name, value)
                    seen = seen .. name .. "=" .. value .. ";"
                  end)
                  return seen
                end
                "#,
            )
            .eval::<Function>()
            .unwrap();
        let seen: String = collect.call(&wrapper).unwrap();
        assert_eq!(seen, ":path=/;foo=bar;");
    }

    #[test]
    fn test_iterate_callback_error_propagates() {
        let lua = Lua::new();
        let mut map = ByteHeaderMap::new();
        map.append("foo", "bar");
        let (_map, dynamic) = shared(map);
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, live()))
            .unwrap();

        let check = lua
            .load(
                r#"
                return function(headers)
                  headers:iterate(function(name, value)
                    error("callback failure")
                  end)
                end
                "#,
            )
            .eval::<Function>()
            .unwrap();
        let err = check.call::<()>(&wrapper).unwrap_err();
        assert!(err.to_string().contains("callback failure"));
    }

    #[test]
    fn test_remove() {
        let lua = Lua::new();
        let mut map = ByteHeaderMap::new();
        map.append("foo", "one");
        map.append("foo", "two");
        let (map, dynamic) = shared(map);
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, live()))
            .unwrap();

        let remove = lua
            .load("return function(headers) headers:remove(\"FOO\") end")
            .eval::<Function>()
            .unwrap();
        remove.call::<()>(&wrapper).unwrap();
        remove.call::<()>(&wrapper).unwrap();
        assert!(map.borrow().is_empty());
    }

    #[test]
    fn test_dead_wrapper() {
        let lua = Lua::new();
        let (_map, dynamic) = shared(ByteHeaderMap::new());
        let flag = live();
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::new(dynamic, flag.clone()))
            .unwrap();

        flag.mark_dead();
        let check = lua
            .load("return function(headers) return headers:get(\"foo\") end")
            .eval::<Function>()
            .unwrap();
        let err = check.call::<()>(&wrapper).unwrap_err();
        assert!(err
            .to_string()
            .contains("object used outside of proper scope"));
    }

    #[test]
    fn test_mutation_after_release() {
        let lua = Lua::new();
        let (_map, dynamic) = shared(ByteHeaderMap::new());
        let released = Rc::new(Cell::new(false));
        let wrapper = lua
            .create_userdata(HeaderMapWrapper::with_release_flag(
                dynamic,
                live(),
                released.clone(),
            ))
            .unwrap();

        let add = lua
            .load("return function(headers) headers:add(\"foo\", \"bar\") end")
            .eval::<Function>()
            .unwrap();
        add.call::<()>(&wrapper).unwrap();

        released.set(true);
        let err = add.call::<()>(&wrapper).unwrap_err();
        assert!(err
            .to_string()
            .contains("header map can no longer be modified"));
    }

    #[test]
    fn test_buffer_byte_size() {
        let lua = Lua::new();
        let flag = live();
        let wrapper = lua
            .create_userdata(BufferWrapper::new(Bytes::from_static(b"hello"), flag.clone()))
            .unwrap();

        let check = lua
            .load("return function(buffer) return buffer:byteSize() end")
            .eval::<Function>()
            .unwrap();
        let size: usize = check.call(&wrapper).unwrap();
        assert_eq!(size, 5);

        flag.mark_dead();
        assert!(check.call::<usize>(&wrapper).is_err());
    }
}
