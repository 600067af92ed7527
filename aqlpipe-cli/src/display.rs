use colored::Colorize;
use serde_json::Value;

const KEYWORDS: &[&str] = &[
    "FOR", "IN", "LET", "FILTER", "SORT", "LIMIT", "COLLECT", "AGGREGATE", "INTO", "WITH",
    "COUNT", "RETURN", "DISTINCT", "INSERT", "REMOVE", "ASC", "DESC", "AND", "OR", "NOT",
];

/// Format result rows for the terminal.
/// If `raw_json` is true, print one compact JSON value per line for piping.
pub fn format_rows(rows: &[Value], raw_json: bool) -> String {
    if raw_json {
        return rows
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
    }
    if rows.is_empty() {
        return "(no rows)".dimmed().to_string();
    }
    rows.iter()
        .map(|row| {
            let mut out = String::new();
            write_value(&mut out, row, 0);
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Highlight AQL keywords, leaving everything else untouched.
pub fn format_query(query: &str) -> String {
    query
        .lines()
        .map(|line| {
            line.split(' ')
                .map(|word| {
                    if KEYWORDS.contains(&word) {
                        word.magenta().bold().to_string()
                    } else {
                        word.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn quoted(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth + 1);
    let close = "  ".repeat(depth);
    match value {
        Value::Null => out.push_str(&"null".dimmed().to_string()),
        Value::Bool(b) => out.push_str(&b.to_string().yellow().to_string()),
        Value::Number(n) => out.push_str(&n.to_string().cyan().to_string()),
        Value::String(s) => out.push_str(&quoted(s).green().to_string()),
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Array(items) => {
            out.push_str("[\n");
            for (i, item) in items.iter().enumerate() {
                out.push_str(&pad);
                write_value(out, item, depth + 1);
                if i + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&close);
            out.push(']');
        }
        Value::Object(map) => {
            out.push_str("{\n");
            for (i, (key, item)) in map.iter().enumerate() {
                out.push_str(&pad);
                out.push_str(&quoted(key).blue().bold().to_string());
                out.push_str(&":".dimmed().to_string());
                out.push(' ');
                write_value(out, item, depth + 1);
                if i + 1 < map.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&close);
            out.push('}');
        }
    }
}
