pub mod formatters;

pub use formatters::{
    format_config_table, format_port_table, formatter_for, CsvFormatter, JsonFormatter,
    RegisterFormatter, TableFormatter,
};
