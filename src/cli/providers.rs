//! `latchkey providers`
//!
//! Lists the backends compiled into this binary with their parameter contracts.

use anyhow::Result;

use super::output::{print_structured, render_table, OutputFormat};
use crate::secrets::ProviderDescriptor;

pub fn handle_providers_command(descriptors: &[ProviderDescriptor], output: &str) -> Result<()> {
    match output.parse::<OutputFormat>()? {
        OutputFormat::Table => print!("{}", providers_table(descriptors)),
        format => print_structured(&descriptors, format)?,
    }
    Ok(())
}

pub(crate) fn providers_table(descriptors: &[ProviderDescriptor]) -> String {
    if descriptors.is_empty() {
        return "No providers available\n".to_string();
    }

    let rows: Vec<Vec<String>> = descriptors
        .iter()
        .map(|d| {
            let optional: Vec<&str> = d
                .parameters
                .iter()
                .filter(|p| !p.required)
                .map(|p| p.name)
                .collect();
            vec![
                d.id.to_string(),
                d.display_name.to_string(),
                d.required_parameters.join(", "),
                optional.join(", "),
            ]
        })
        .collect();

    render_table(
        &[("ID", 26), ("Name", 36), ("Required", 34), ("Optional", 60)],
        &rows,
    )
}
