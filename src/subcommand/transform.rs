//! The `transform` subcommand.

use std::error::Error;
use std::fs;

use clap::ArgMatches;
use log::info;
use molt_transform::{rewrite_assembly, TransformOptions};
use molt_types::bytecode::Assembly;
use molt_types::descriptor::DescriptorCatalog;

use crate::cli;

pub fn exec(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = matches
        .get_one::<String>(cli::ARG_INPUT)
        .expect("required arg");
    let output = matches
        .get_one::<String>(cli::ARG_OUTPUT)
        .expect("required arg");

    let mut options = TransformOptions {
        include_backward_branches: !matches.get_flag(cli::ARG_NO_BACKWARD_BRANCHES),
        include_instruction_counting: !matches.get_flag(cli::ARG_NO_INSTRUCTION_COUNTING),
        include_external_calls: matches.get_flag(cli::ARG_EXTERNAL_CALLS),
        ..TransformOptions::default()
    };
    if let Some(names) = matches.get_many::<String>(cli::ARG_INTERNAL_ASSEMBLY) {
        options.internal_assemblies = names.cloned().collect();
    }
    if let Some(attribute) = matches.get_one::<String>(cli::ARG_ATTRIBUTE) {
        options.continuable_attribute = attribute.clone();
    }

    let raw = fs::read(input)?;
    let mut assembly: Assembly = serde_json::from_slice(&raw)?;
    info!("loaded assembly {} from {input}", assembly.name);

    let mut catalog = DescriptorCatalog::new();
    let report = rewrite_assembly(&mut assembly, &options, &mut catalog)?;

    fs::write(output, serde_json::to_vec_pretty(&assembly)?)?;

    println!(
        "transformed {} method(s), {} unchanged, {} skipped, {} failure(s)",
        report.transformed.len(),
        report.unchanged,
        report.skipped_bodyless,
        report.failures.len()
    );
    for outcome in &report.transformed {
        println!(
            "  token {:#010x}: {} yield point(s), {} spill temp(s)",
            outcome.method_token as u32, outcome.yield_point_count, outcome.spill_temp_count
        );
    }
    for failure in &report.failures {
        println!("  failed: {failure}");
    }
    Ok(())
}
