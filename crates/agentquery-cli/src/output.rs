use std::io::Write;

use agentquery_service::service::{Agent, Category, ToolDescriptor};
use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

pub fn tools_table(tools: &[ToolDescriptor]) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Name", "Plugin", "Description"]);
    for tool in tools {
        table.add_row(row![
            tool.name,
            or_dash(tool.plugin_key.as_deref()),
            or_dash(tool.description.as_deref()),
        ]);
    }
    table
}

pub fn agents_table<'a>(agents: impl IntoIterator<Item = &'a Agent>) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Id", "Name", "Category", "Author"]);
    for agent in agents {
        table.add_row(row![
            agent.id,
            or_dash(agent.name.as_deref()),
            or_dash(agent.category.as_deref()),
            or_dash(agent.author.as_deref()),
        ]);
    }
    table
}

pub fn categories_table(categories: &[Category]) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Value", "Label", "Agents"]);
    for category in categories {
        let count = category
            .count
            .map_or_else(|| "-".to_owned(), |count| count.to_string());
        table.add_row(row![category.value, category.label, r -> count]);
    }
    table
}

/// A two-column table listing the fields of a single agent.
pub fn agent_table(agent: &Agent) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row![r -> "Id:", agent.id]);
    table.add_row(row![r -> "Name:", or_dash(agent.name.as_deref())]);
    table.add_row(row![r -> "Category:", or_dash(agent.category.as_deref())]);
    table.add_row(row![r -> "Author:", or_dash(agent.author.as_deref())]);
    table.add_row(row![r -> "Description:", or_dash(agent.description.as_deref())]);
    for (key, value) in &agent.extra {
        table.add_row(row![r -> format!("{key}:"), value]);
    }
    table
}
