use std::fs;
use std::time::Duration;

use modbus_utility::modbus::slave::FIXTURE_REPLY;
use modbus_utility::utils::init_logging;
use modbus_utility::{MasterOptions, MemoryTransport, ModbusError, ModbusMaster};

// The global logger can be installed once per process, so this file holds a
// single test.
#[test]
fn transactions_are_appended_to_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modbus_utility.log");
    fs::write(&path, "earlier run\n").unwrap();

    init_logging("info", Some(&path)).unwrap();

    let options = MasterOptions {
        settle: Duration::ZERO,
        retries: 0,
    };
    let link = MemoryTransport::with_replies(vec![FIXTURE_REPLY.to_vec()]);
    let mut master = ModbusMaster::new(link, 1, options);

    assert_eq!(master.read_holding_registers(0, 2).unwrap(), vec![0x45EA, 0x3200]);
    let log = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2, "{}", log);
    assert_eq!(lines[0], "earlier run");
    assert!(lines[1].contains("INFO") && lines[1].contains("Read register 0"));

    assert!(matches!(
        master.read_holding_registers(0, 2),
        Err(ModbusError::IncompleteFrame { expected: 9, received: 0 })
    ));
    let log = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3, "{}", log);
    assert!(lines[2].contains("ERROR") && lines[2].contains("Failed to read register 0"));

    assert!(init_logging("info", Some(&path)).is_err());
}
