use eyre::{Result, eyre};
use ykoath_apdu_transport_pcsc::{PcscDeviceManager, PcscReader};

/// Find a reader with a specific name
pub fn find_reader_by_name(manager: &PcscDeviceManager, reader_name: &str) -> Result<PcscReader> {
    let readers = manager.list_readers()?;

    readers
        .iter()
        .find(|r| r.name() == reader_name)
        .cloned()
        .ok_or_else(|| eyre!("Reader '{}' not found", reader_name))
}

/// The named reader, or the first one holding an ISO-DEP tag
pub fn find_reader(manager: &PcscDeviceManager, reader_name: Option<&str>) -> Result<PcscReader> {
    match reader_name {
        Some(name) => find_reader_by_name(manager, name),
        None => Ok(manager.find_iso_dep_reader()?),
    }
}

/// List all available readers
pub fn list_readers(manager: &PcscDeviceManager) -> Result<()> {
    let readers = manager.list_readers()?;

    if readers.is_empty() {
        println!("No readers found!");
        return Ok(());
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        let status = if reader.is_iso_dep() {
            "ISO-DEP tag present"
        } else if reader.has_card() {
            "unsupported tag"
        } else {
            "no tag"
        };
        println!("{}. {} ({})", i + 1, reader.name(), status);
    }

    Ok(())
}
