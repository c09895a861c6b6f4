//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use scadbox::OutputFormat;
use scadbox::isolate::WorkerArgs;
use std::path::PathBuf;

/// Compile CAD sources in a throwaway sandbox.
#[derive(Parser, Debug)]
#[command(name = "scadbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a source file to a mesh.
    Compile(CompileArgs),

    /// Run as an isolate subprocess (internal).
    #[command(hide = true)]
    Worker(WorkerCommandArgs),
}

/// Arguments for the compile command.
#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Source file to compile.
    pub file: PathBuf,

    /// Output file (default: the source path with an .stl extension).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Mesh format.
    #[arg(short, long, value_enum, default_value_t = FormatArg::Binary)]
    pub format: FormatArg,

    /// Compiler executable, absolute or looked up on PATH.
    #[arg(long, env = "SCADBOX_COMPILER", default_value = "openscad")]
    pub compiler: PathBuf,

    /// Directory of font files to seed into the sandbox.
    #[arg(long, env = "SCADBOX_FONT_DIR")]
    pub font_dir: Option<PathBuf>,

    /// Compile deadline in seconds (0 disables).
    #[arg(long, env = "SCADBOX_COMPILE_TIMEOUT_SECS")]
    pub timeout: Option<u64>,

    /// Print the result summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Arguments of the hidden isolate mode.
#[derive(Args, Debug)]
pub struct WorkerCommandArgs {
    /// Compiler executable to load.
    #[arg(long)]
    pub image: PathBuf,

    /// Expected SHA-256 of the executable.
    #[arg(long)]
    pub digest: Option<String>,

    /// Directory of font files.
    #[arg(long)]
    pub font_dir: Option<PathBuf>,
}

impl From<&WorkerCommandArgs> for WorkerArgs {
    fn from(args: &WorkerCommandArgs) -> Self {
        WorkerArgs {
            image: args.image.clone(),
            digest: args.digest.clone(),
            font_dir: args.font_dir.clone(),
        }
    }
}

/// Mesh format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatArg {
    #[default]
    Binary,
    Ascii,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Binary => OutputFormat::MeshBinary,
            FormatArg::Ascii => OutputFormat::MeshAscii,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_compile_args() {
        let cli = Cli::try_parse_from([
            "scadbox", "compile", "part.scad", "-o", "part.stl", "--format", "ascii",
            "--compiler", "/usr/bin/openscad", "--timeout", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Compile(args) => {
                assert_eq!(args.file, PathBuf::from("part.scad"));
                assert_eq!(args.output, Some(PathBuf::from("part.stl")));
                assert_eq!(OutputFormat::from(args.format), OutputFormat::MeshAscii);
                assert_eq!(args.compiler, PathBuf::from("/usr/bin/openscad"));
                assert_eq!(args.timeout, Some(5));
            }
            other => panic!("Expected Compile, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_args() {
        let cli = Cli::try_parse_from([
            "scadbox", "worker", "--image", "/bin/sh", "--digest", "abc",
        ])
        .unwrap();
        match &cli.command {
            Commands::Worker(args) => {
                let args = WorkerArgs::from(args);
                assert_eq!(args.image, PathBuf::from("/bin/sh"));
                assert_eq!(args.digest.as_deref(), Some("abc"));
                assert_eq!(args.font_dir, None);
            }
            other => panic!("Expected Worker, got {:?}", other),
        }
    }
}
