//! Macro records and the macro table.

use std::{collections::HashMap, rc::Rc};

use bitflags::bitflags;
use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
};
use cushion_lexer::Token;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MacroFlags: u8 {
        /// Function-like; even a macro without parameters can be one.
        const FUNCTION = 1 << 0;
        const VARIADIC = 1 << 1;
        /// Marked with `__CUSHION_PRESERVE__`: never expanded, uses and the
        /// definition itself are echoed into the output.
        const PRESERVED = 1 << 2;
        /// Replacement list mentions `__CUSHION_WRAPPED__`; invocations are
        /// followed by a braced block.
        const WRAPPED = 1 << 3;
    }
}

/// A single macro definition. Replacement lists never contain newline, glue
/// or comment tokens; those are dropped while the definition is lexed.
#[derive(Debug)]
pub struct Macro {
    pub name: String,
    pub flags: MacroFlags,
    pub parameters: Vec<String>,
    pub replacement: Vec<Token>,
}

/// Table of known macros, keyed on the identifier bytes.
#[derive(Debug, Default)]
pub struct MacroTable {
    map: HashMap<String, Rc<Macro>>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a macro, applying the redefinition policy: under the strict
    /// option a redefinition during execution is an error, otherwise the
    /// existing record is replaced in place.
    pub fn insert(
        &mut self,
        definition: Macro,
        location: &SourceLocation,
        forbid_redefinition: bool,
        in_execution: bool,
    ) -> Result<()> {
        if forbid_redefinition && in_execution && self.map.contains_key(&definition.name) {
            return Err(Error::semantics(
                location.clone(),
                format!("Encountered macro \"{}\" redefinition.", definition.name),
            ));
        }

        self.map
            .insert(definition.name.clone(), Rc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<Macro>> {
        self.map.get(name).cloned()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.map.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_macro(name: &str, replacement: &str) -> Macro {
        Macro {
            name: name.to_owned(),
            flags: MacroFlags::empty(),
            parameters: vec![],
            replacement: vec![Token::identifier(replacement)],
        }
    }

    #[test]
    fn redefinition_replaces_in_place_by_default() {
        let mut table = MacroTable::new();
        let location = SourceLocation::none();
        table
            .insert(object_macro("X", "first"), &location, false, true)
            .unwrap();
        table
            .insert(object_macro("X", "second"), &location, false, true)
            .unwrap();
        assert_eq!(table.lookup("X").unwrap().replacement[0].text, "second");
    }

    #[test]
    fn strict_redefinition_is_an_error_only_during_execution() {
        let mut table = MacroTable::new();
        let location = SourceLocation::none();
        table
            .insert(object_macro("X", "first"), &location, true, false)
            .unwrap();
        // Configuration stage may override silently.
        table
            .insert(object_macro("X", "second"), &location, true, false)
            .unwrap();
        // Execution stage must not.
        let error = table
            .insert(object_macro("X", "third"), &location, true, true)
            .unwrap_err();
        assert!(error.message.contains("redefinition"), "{error}");
    }

    #[test]
    fn remove_makes_macro_undefined() {
        let mut table = MacroTable::new();
        let location = SourceLocation::none();
        table
            .insert(object_macro("X", "value"), &location, false, false)
            .unwrap();
        assert!(table.is_defined("X"));
        table.remove("X");
        assert!(!table.is_defined("X"));
    }
}
