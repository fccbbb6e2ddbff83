//! A C preprocessor built to feed cleaned-up translation units to code
//! parsers and generators.
//!
//! [`Context`] is the configuration surface: inputs, the output path,
//! include search paths (full or scan-only), command-line defines, feature
//! and option flags, and an optional Make-style depfile. [`Context::execute`]
//! runs the whole pipeline and either produces the output files or returns
//! the first error encountered.

pub mod macros;
pub mod output;
pub mod tokens;

mod defer;
mod directives;
mod evaluate;
mod expand;
mod extensions;
mod lexer;

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use cushion_foundation::errors::{Error, Result};
use cushion_lexer::Tokenizer;
use tracing::debug;

use crate::{
    macros::{Macro, MacroFlags, MacroTable},
    output::{DepfileSet, Output},
};

bitflags! {
    /// Extension features; everything is off by default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u32 {
        const DEFER = 1 << 0;
        const WRAPPER_MACRO = 1 << 1;
        const STATEMENT_ACCUMULATOR = 1 << 2;
        const SNIPPET = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Options: u32 {
        const FORBID_MACRO_REDEFINITION = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeKind {
    /// Included files are processed and emitted into the output.
    Full,
    /// Included files only contribute macro definitions and dependency
    /// records; their tokens never reach the output.
    Scan,
}

#[derive(Debug, Clone)]
pub struct IncludePath {
    pub path: Utf8PathBuf,
    pub kind: IncludeKind,
}

/// Everything the engine needs, configured up front.
#[derive(Debug, Default)]
pub struct Context {
    features: Features,
    options: Options,
    inputs: Vec<Utf8PathBuf>,
    output_path: Option<Utf8PathBuf>,
    depfile_path: Option<Utf8PathBuf>,
    defines: Vec<(String, String)>,
    includes: Vec<IncludePath>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_feature(&mut self, feature: Features) -> &mut Self {
        self.features |= feature;
        self
    }

    pub fn enable_option(&mut self, option: Options) -> &mut Self {
        self.options |= option;
        self
    }

    pub fn add_input(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.inputs.push(path.into());
        self
    }

    pub fn set_output(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn set_depfile(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.depfile_path = Some(path.into());
        self
    }

    /// Registers a command-line definition. The value is lexed into a
    /// replacement list before any input is processed.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    pub fn add_include(&mut self, path: impl Into<Utf8PathBuf>, kind: IncludeKind) -> &mut Self {
        self.includes.push(IncludePath {
            path: path.into(),
            kind,
        });
        self
    }

    /// Runs the preprocessor over every configured input, in order, into the
    /// configured output. A single error aborts the whole execution.
    pub fn execute(self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::configuration("Missing inputs in configuration."));
        }
        let Some(output_path) = self.output_path else {
            return Err(Error::configuration("Missing output path in configuration."));
        };

        let destination = std::fs::File::create(&output_path).map_err(|error| {
            Error::configuration(format!(
                "Failed to open output file \"{output_path}\": {error}."
            ))
        })?;

        let mut engine = Engine {
            features: self.features,
            options: self.options,
            in_execution: false,
            includes: self.includes,
            macros: MacroTable::new(),
            pragma_once: HashSet::new(),
            depfile: DepfileSet::new(),
            output: Output::new(Box::new(std::io::BufWriter::new(destination))),
            accumulators: Vec::new(),
            accumulator_refs: HashMap::new(),
            unordered_pushes: Vec::new(),
            replacement_index: 0,
            cached_return_counter: 0,
        };

        engine.resolve_configuration_defines(&self.defines)?;
        engine.in_execution = true;

        for input in &self.inputs {
            debug!(input = %input, "processing input");
            lexer::lex_root_file(&mut engine, input)?;
        }

        extensions::finalize_statement_accumulators(&mut engine)?;
        engine.output.finalize()?;

        if let Some(depfile_path) = &self.depfile_path {
            engine.write_depfile(depfile_path, &output_path)?;
        }
        Ok(())
    }
}

/// The single engine state of one execution: shared tables, configuration
/// and the output. Per-file state lives in [`lexer::FileState`] and dies
/// with each file.
pub(crate) struct Engine {
    pub features: Features,
    pub options: Options,
    pub in_execution: bool,
    pub includes: Vec<IncludePath>,
    pub macros: MacroTable,
    pub pragma_once: HashSet<String>,
    pub depfile: DepfileSet,
    pub output: Output,

    pub accumulators: Vec<extensions::StatementAccumulator>,
    pub accumulator_refs: HashMap<String, usize>,
    pub unordered_pushes: Vec<extensions::UnorderedPush>,

    /// Incremented once per macro replacement; the value behind
    /// `__CUSHION_REPLACEMENT_INDEX__`.
    pub replacement_index: u64,
    /// Numbers the `cushion_cached_return_value_N` locals defer generates.
    pub cached_return_counter: u64,
}

impl Engine {
    pub fn find_accumulator_index(&self, name: &str) -> Option<usize> {
        self.accumulators
            .iter()
            .position(|accumulator| accumulator.name == name)
    }

    /// Turns the raw `(name, value)` configuration defines into real macro
    /// records. After this pass, every macro in the table carries a
    /// replacement list.
    fn resolve_configuration_defines(&mut self, defines: &[(String, String)]) -> Result<()> {
        for (name, value) in defines {
            let mut tokenizer = Tokenizer::from_str(value, std::rc::Rc::from("<argument-string>"));
            let mut replacement = Vec::new();
            let mut flags = MacroFlags::empty();

            let result = directives::lex_replacement_list_from_tokenizer(
                self.features,
                &mut tokenizer,
                &mut replacement,
                &mut flags,
            )
            .map_err(|error| {
                Error::new(
                    error.kind,
                    error.location,
                    format!(
                        "Failed to lex macro \"{name}\" from configuration: {}",
                        error.message
                    ),
                )
            })?;

            if result == directives::ReplacementListResult::Preserved {
                return Err(Error::semantics(
                    tokenizer.location(),
                    format!(
                        "Encountered __CUSHION_PRESERVE__ while lexing macro \"{name}\" from \
                         configuration, which is not supported."
                    ),
                ));
            }
            if flags.contains(MacroFlags::WRAPPED) {
                return Err(Error::semantics(
                    tokenizer.location(),
                    format!(
                        "Macro \"{name}\" from configuration cannot use __CUSHION_WRAPPED__; the \
                         feature is only supported for macros defined in code."
                    ),
                ));
            }
            if !tokenizer.fully_consumed() {
                return Err(Error::semantics(
                    tokenizer.location(),
                    format!(
                        "Macro \"{name}\" from configuration cannot be fully lexed: the value \
                         contains a new line in the middle."
                    ),
                ));
            }

            let location = tokenizer.location();
            self.macros.insert(
                Macro {
                    name: name.clone(),
                    flags,
                    parameters: Vec::new(),
                    replacement,
                },
                &location,
                self.options.contains(Options::FORBID_MACRO_REDEFINITION),
                self.in_execution,
            )?;
        }
        Ok(())
    }

    fn write_depfile(&self, depfile_path: &Utf8Path, output_path: &Utf8Path) -> Result<()> {
        std::fs::write(depfile_path, self.depfile.render(output_path.as_str())).map_err(|error| {
            Error::configuration(format!(
                "Failed to write depfile \"{depfile_path}\": {error}."
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_requires_inputs_and_output() {
        let error = Context::new().execute().unwrap_err();
        assert!(error.message.contains("inputs"), "{error}");

        let mut context = Context::new();
        context.add_input("whatever.c");
        let error = context.execute().unwrap_err();
        assert!(error.message.contains("output"), "{error}");
    }

    #[test]
    fn configuration_define_with_newline_is_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let input = directory.path().join("input.c");
        std::fs::write(&input, "int x;\n").unwrap();

        let mut context = Context::new();
        context
            .add_input(input.to_str().unwrap())
            .set_output(directory.path().join("out.c").to_str().unwrap())
            .define("BROKEN", "1\n2");
        let error = context.execute().unwrap_err();
        assert!(error.message.contains("new line"), "{error}");
    }

    #[test]
    fn configuration_define_with_preserve_is_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let input = directory.path().join("input.c");
        std::fs::write(&input, "int x;\n").unwrap();

        let mut context = Context::new();
        context
            .add_input(input.to_str().unwrap())
            .set_output(directory.path().join("out.c").to_str().unwrap())
            .define("BROKEN", "__CUSHION_PRESERVE__ 1");
        let error = context.execute().unwrap_err();
        assert!(error.message.contains("__CUSHION_PRESERVE__"), "{error}");
    }
}
