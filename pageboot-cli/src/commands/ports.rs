//! Port listing.

use {
    anyhow::Result,
    console::style,
    pageboot::{DetectedPort, discover_ports, host::rank_ports},
    serde::Serialize,
};

/// One `list-ports --json` entry.
#[derive(Serialize)]
struct PortEntry<'a> {
    #[serde(flatten)]
    port: &'a DetectedPort,
    known: bool,
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = rank_ports(discover_ports());

    if json {
        let ports: Vec<PortEntry<'_>> = detected
            .iter()
            .map(|port| PortEntry {
                port,
                known: port.bridge.is_known(),
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("no serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let line = port.describe();
        if port.bridge.is_known() {
            eprintln!("  {} {}", style("•").green(), style(line).cyan());
        } else {
            eprintln!("  {} {}", style("•").dim(), line);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, pageboot::BridgeKind};

    #[test]
    fn test_port_entry_json() {
        let mut port = DetectedPort::plain("/dev/ttyUSB0");
        port.bridge = BridgeKind::from_vid_pid(0x1A86, 0x7523);
        port.vid = Some(0x1A86);
        port.pid = Some(0x7523);
        let entry = PortEntry {
            port: &port,
            known: port.bridge.is_known(),
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["name"], "/dev/ttyUSB0");
        assert_eq!(value["bridge"], "CH340/CH341");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x1A86);
        assert!(value["serial"].is_null());
    }
}
