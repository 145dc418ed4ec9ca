//! Environment capture.
//!
//! The parent environment is read once per invocation with `TERM` forced
//! to `dumb` and `COLORTERM` stripped, so spawned tools produce stable,
//! colour-free output. Scripts adjust it further through the `setenv`
//! native.

use indexmap::IndexMap;

/// The environment handed to every spawned command.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    vars: IndexMap<String, String>,
}

impl Environment {
    /// Captures the process environment with the terminal overrides
    /// applied.
    #[must_use]
    pub fn capture() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Builds the environment from an explicit variable list. Used by
    /// tests and by [`Environment::capture`].
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut map = IndexMap::new();
        map.insert("TERM".to_owned(), "dumb".to_owned());
        for (name, value) in vars {
            if name == "TERM" || name == "COLORTERM" {
                continue;
            }
            map.insert(name, value);
        }
        Self { vars: map }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets or removes a variable. `None` removes.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.vars.insert(name.to_owned(), value);
            }
            None => {
                self.vars.shift_remove(name);
            }
        }
    }

    /// Iterates the full variable table in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
