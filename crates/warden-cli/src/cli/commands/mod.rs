pub mod bundle_sign;
pub mod bundle_validate;
pub mod bundle_verify;
pub mod check;

use super::args::{BundleCmd, Cli, Command};

pub fn dispatch(cli: Cli) -> i32 {
    match cli.cmd {
        Command::Bundle(args) => match args.cmd {
            BundleCmd::Validate(args) => bundle_validate::cmd_validate(args),
            BundleCmd::Sign(args) => bundle_sign::cmd_sign(args),
            BundleCmd::Verify(args) => bundle_verify::cmd_verify(args),
        },
        Command::Check(args) => check::cmd_check(args),
    }
}
