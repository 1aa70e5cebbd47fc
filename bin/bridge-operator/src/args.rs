//! Parses command-line arguments for the operator CLI.

use std::path::PathBuf;

use argh::FromArgs;

#[derive(Debug, FromArgs)]
#[argh(name = "catbridge-operator")]
#[argh(description = "The OP_CAT covenant bridge operator")]
pub(crate) struct Cli {
    #[argh(option, short = 'c', description = "path to the TOML configuration file")]
    pub config: PathBuf,

    #[argh(
        option,
        description = "path to the hex-encoded operator secret key (default: `secrets.operator_key` from the config, or envvar CATBRIDGE_OPERATOR_KEY)"
    )]
    pub operator_key_path: Option<PathBuf>,

    #[argh(
        switch,
        description = "do not read events from stdin, only watch blocks"
    )]
    pub no_stdin: bool,
}
