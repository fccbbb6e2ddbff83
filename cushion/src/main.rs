use anyhow::bail;
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use cushion_preprocessor::{Context, Features, IncludeKind, Options};
use tracing::{error, metadata::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};

/// C preprocessor for feeding code to code parsers and generators.
#[derive(Debug, Parser)]
#[command(name = "cushion", version)]
pub struct Args {
    /// Input files for preprocessing. Multiple inputs are treated like one
    /// file that includes all of them in order.
    #[clap(short, long, required = true)]
    input: Vec<Utf8PathBuf>,

    /// The single output file.
    #[clap(short, long)]
    output: Utf8PathBuf,

    /// Make-style depfile listing every file that was opened.
    #[clap(long)]
    depfile: Option<Utf8PathBuf>,

    /// Command line definition, either NAME or NAME=VALUE ("1" is used when
    /// no value is given).
    #[clap(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Include search path whose files are fully included.
    #[clap(long = "include-full")]
    include_full: Vec<Utf8PathBuf>,

    /// Include search path whose files only contribute macro definitions
    /// and dependency info.
    #[clap(long = "include-scan")]
    include_scan: Vec<Utf8PathBuf>,

    /// Extension features to enable.
    #[clap(long = "feature")]
    features: Vec<Feature>,

    /// Report an error when a macro is redefined.
    #[clap(long)]
    forbid_macro_redefinition: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Feature {
    /// CUSHION_DEFER scoped cleanup blocks.
    Defer,
    /// Wrapper macros receiving a braced code block.
    WrapperMacro,
    /// Statement accumulators with ordered and unordered pushes.
    StatementAccumulator,
    /// Snippet macros and evaluated-argument helpers.
    Snippet,
}

impl Feature {
    fn flag(self) -> Features {
        match self {
            Feature::Defer => Features::DEFER,
            Feature::WrapperMacro => Features::WRAPPER_MACRO,
            Feature::StatementAccumulator => Features::STATEMENT_ACCUMULATOR,
            Feature::Snippet => Features::SNIPPET,
        }
    }
}

pub fn fallible_main(args: Args) -> anyhow::Result<()> {
    // The include search order is the order paths were given on the command
    // line; clap keeps each flag's values separately, so interleave is not
    // representable. Full paths are searched before scan paths.
    let mut context = Context::new();

    for feature in &args.features {
        context.enable_feature(feature.flag());
    }
    if args.forbid_macro_redefinition {
        context.enable_option(Options::FORBID_MACRO_REDEFINITION);
    }

    for define in &args.defines {
        match define.split_once('=') {
            Some((name, value)) => context.define(name, value),
            None => context.define(define.as_str(), "1"),
        };
    }

    for path in &args.include_full {
        context.add_include(path.clone(), IncludeKind::Full);
    }
    for path in &args.include_scan {
        context.add_include(path.clone(), IncludeKind::Scan);
    }

    for input in &args.input {
        if !input.is_file() {
            bail!("input {input:?} is not a file");
        }
        context.add_input(input.clone());
    }
    context.set_output(args.output);
    if let Some(depfile) = args.depfile {
        context.set_depfile(depfile);
    }

    context.execute().map_err(|err| anyhow::anyhow!("{err}"))?;
    Ok(())
}

fn main() -> std::process::ExitCode {
    let subscriber = tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        );
    tracing::subscriber::set_global_default(subscriber)
        .expect("cannot set default tracing subscriber");

    let args = Args::parse();

    match fallible_main(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
