//! Listing commands

/// Print the serial ports present on this machine
pub fn list_ports() -> Result<(), Box<dyn std::error::Error>> {
    let ports = stkbridge_serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    println!("Serial ports:");
    for port in ports {
        println!("  {}", port);
    }
    println!();
    println!("Use \"sim\" as the port to run against a simulated peer.");
    Ok(())
}
