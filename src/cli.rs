//! Command-line definition.

use clap::{Arg, ArgAction, Command};

pub const CMD_TRANSFORM: &str = "transform";
pub const CMD_INSPECT: &str = "inspect";

pub const ARG_INPUT: &str = "input";
pub const ARG_OUTPUT: &str = "output";
pub const ARG_NO_BACKWARD_BRANCHES: &str = "no-backward-branches";
pub const ARG_NO_INSTRUCTION_COUNTING: &str = "no-instruction-counting";
pub const ARG_EXTERNAL_CALLS: &str = "external-calls";
pub const ARG_INTERNAL_ASSEMBLY: &str = "internal-assembly";
pub const ARG_ATTRIBUTE: &str = "attribute";

pub fn build_cli() -> Command {
    Command::new("molt")
        .author("Molt Core Dev <dev@molt.dev>")
        .about("Rewrites annotated methods of a bytecode assembly for suspend/resume")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(transform())
        .subcommand(inspect())
}

fn transform() -> Command {
    Command::new(CMD_TRANSFORM)
        .about("Transforms an assembly in place: reads one JSON container, writes another")
        .arg(
            Arg::new(ARG_INPUT)
                .short('i')
                .long(ARG_INPUT)
                .value_name("PATH")
                .required(true)
                .help("Input assembly container"),
        )
        .arg(
            Arg::new(ARG_OUTPUT)
                .short('o')
                .long(ARG_OUTPUT)
                .value_name("PATH")
                .required(true)
                .help("Where to write the rewritten assembly"),
        )
        .arg(
            Arg::new(ARG_NO_BACKWARD_BRANCHES)
                .long(ARG_NO_BACKWARD_BRANCHES)
                .action(ArgAction::SetTrue)
                .help("Do not inject yield checks at loop-closing branches"),
        )
        .arg(
            Arg::new(ARG_NO_INSTRUCTION_COUNTING)
                .long(ARG_NO_INSTRUCTION_COUNTING)
                .action(ArgAction::SetTrue)
                .help("Poll the yield flag only; do not charge the instruction budget"),
        )
        .arg(
            Arg::new(ARG_EXTERNAL_CALLS)
                .long(ARG_EXTERNAL_CALLS)
                .action(ArgAction::SetTrue)
                .help("Also inject yield checks before calls that leave the trust zone"),
        )
        .arg(
            Arg::new(ARG_INTERNAL_ASSEMBLY)
                .long(ARG_INTERNAL_ASSEMBLY)
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Assembly identity considered inside the trust zone (repeatable)"),
        )
        .arg(
            Arg::new(ARG_ATTRIBUTE)
                .long(ARG_ATTRIBUTE)
                .value_name("NAME")
                .help("Marker attribute name (simple or fully qualified)"),
        )
}

fn inspect() -> Command {
    Command::new(CMD_INSPECT)
        .about("Prints the methods, tokens and bodies of an assembly container")
        .arg(
            Arg::new(ARG_INPUT)
                .short('i')
                .long(ARG_INPUT)
                .value_name("PATH")
                .required(true)
                .help("Assembly container to inspect"),
        )
}
