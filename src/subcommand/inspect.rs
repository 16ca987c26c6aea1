//! The `inspect` subcommand.

use std::error::Error;
use std::fs;

use clap::ArgMatches;
use molt_types::bytecode::{Assembly, TypeDef};

use crate::cli;

pub fn exec(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = matches
        .get_one::<String>(cli::ARG_INPUT)
        .expect("required arg");
    let raw = fs::read(input)?;
    let assembly: Assembly = serde_json::from_slice(&raw)?;

    println!("assembly {}", assembly.name);
    for module in &assembly.modules {
        println!("module {}", module.name);
        for ty in &module.types {
            print_type(ty, 1);
        }
    }
    Ok(())
}

fn print_type(ty: &TypeDef, indent: usize) {
    let pad = "  ".repeat(indent);
    println!("{pad}type {}", ty.name);
    for method in &ty.methods {
        let body = match &method.body {
            Some(body) => format!(
                "{} instruction(s), {} local(s), {} handler(s)",
                body.instructions.len(),
                body.locals.len(),
                body.handlers.len()
            ),
            None => "no body".to_string(),
        };
        let marks = if method.attributes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", method.attributes.join(", "))
        };
        println!(
            "{pad}  {} token {:#010x}{marks}: {body}",
            method.name,
            method.token(&ty.name) as u32
        );
    }
    for nested in &ty.nested {
        print_type(nested, indent + 1);
    }
}
