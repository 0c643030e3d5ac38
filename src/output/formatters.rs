use chrono::Utc;

use crate::config::settings::DeviceConfig;
use crate::modbus::transport::PortInfo;

/// Renders the values of a register read for the console.
pub trait RegisterFormatter: Send + Sync {
    fn format_registers(&self, start_register: u16, values: &[u16]) -> String;
    fn format_header(&self) -> String;

    fn format(&self, start_register: u16, values: &[u16]) -> String {
        let mut output = self.format_header();
        output.push_str(&self.format_registers(start_register, values));
        output
    }
}

/// REGISTER / VALUE table, values in hex unless `hex` is off.
pub struct TableFormatter {
    pub hex: bool,
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self { hex: true }
    }
}

impl RegisterFormatter for TableFormatter {
    fn format_registers(&self, start_register: u16, values: &[u16]) -> String {
        let rows: Vec<Vec<String>> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let register = u32::from(start_register) + i as u32;
                let value = if self.hex {
                    format!("0x{:04X}", value)
                } else {
                    value.to_string()
                };
                vec![register.to_string(), value]
            })
            .collect();

        render_table(&["REGISTER", "VALUE"], &rows)
    }

    fn format_header(&self) -> String {
        String::new()
    }
}

pub struct JsonFormatter;

impl RegisterFormatter for JsonFormatter {
    fn format_registers(&self, start_register: u16, values: &[u16]) -> String {
        let registers: Vec<serde_json::Value> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                serde_json::json!({
                    "register": u32::from(start_register) + i as u32,
                    "value": value,
                })
            })
            .collect();

        let result = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "start_register": start_register,
            "registers": registers,
        });

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }
}

pub struct CsvFormatter;

impl RegisterFormatter for CsvFormatter {
    fn format_registers(&self, start_register: u16, values: &[u16]) -> String {
        let timestamp = Utc::now().to_rfc3339();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                format!("{},{},{}\n", u32::from(start_register) + i as u32, value, timestamp)
            })
            .collect()
    }

    fn format_header(&self) -> String {
        "Register,Value,Timestamp\n".to_string()
    }
}

/// Picks a formatter by its command line name.
pub fn formatter_for(name: &str, hex: bool) -> Option<Box<dyn RegisterFormatter>> {
    match name {
        "table" => Some(Box::new(TableFormatter { hex })),
        "json" => Some(Box::new(JsonFormatter)),
        "csv" => Some(Box::new(CsvFormatter)),
        _ => None,
    }
}

pub fn format_port_table(ports: &[PortInfo]) -> String {
    let rows: Vec<Vec<String>> = ports
        .iter()
        .map(|port| vec![port.device.clone(), port.description.clone()])
        .collect();
    render_table(&["PORT", "DESCRIPTION"], &rows)
}

pub fn format_config_table(config: &DeviceConfig) -> String {
    let rows: Vec<Vec<String>> = config
        .entries()
        .into_iter()
        .map(|(name, value)| vec![name.to_string(), value])
        .collect();
    render_table(&["PARAMETER", "VALUE"], &rows)
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line.push('\n');
        line
    };

    let mut output = separator.clone();
    output.push_str(&render_row(headers, &widths));
    output.push_str(&separator);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        output.push_str(&render_row(&cells, &widths));
    }
    output.push_str(&separator);
    output
}

fn render_row(cells: &[&str], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, width) in cells.iter().zip(widths) {
        line.push_str(&format!(" {:<width$} |", cell, width = *width));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_hex_and_decimal() {
        let hex = TableFormatter { hex: true }.format(0, &[0x45EA, 0x3200]);
        assert!(hex.contains("| 0        | 0x45EA |"));
        assert!(hex.contains("| 1        | 0x3200 |"));

        let decimal = TableFormatter { hex: false }.format(10, &[42]);
        assert!(decimal.contains("| 10       | 42    |"));
    }

    #[test]
    fn test_json_output_is_parseable() {
        let output = JsonFormatter.format(65535, &[1]);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["registers"][0]["register"], 65535);
        assert_eq!(parsed["registers"][0]["value"], 1);
    }

    #[test]
    fn test_csv_rows() {
        let output = CsvFormatter.format(7, &[1, 2]);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "Register,Value,Timestamp");
        assert!(lines[1].starts_with("7,1,"));
        assert!(lines[2].starts_with("8,2,"));
    }

    #[test]
    fn test_formatter_lookup() {
        assert!(formatter_for("json", true).is_some());
        assert!(formatter_for("xml", true).is_none());
    }

    #[test]
    fn test_config_table_lists_all_fields() {
        let table = format_config_table(&DeviceConfig::new("/dev/ttyUSB0", 17));
        for key in ["PORT", "ADDRESS", "BAUD RATE", "PARITY", "STOP BITS", "TIMEOUT"] {
            assert!(table.contains(key), "missing {}", key);
        }
        assert!(table.contains("/dev/ttyUSB0"));
    }
}
