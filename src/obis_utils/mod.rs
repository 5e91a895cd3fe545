use std::collections::HashMap;

/// Turns the SML encoding of an OBIS code (`070100010800ff`, an octet string
/// of length 6 with its type-length byte) into `1-0:1.8.0*255`.
///
/// Anything that is not a complete seven byte octet string is returned as is.
pub fn format_obis_pattern(pattern: &str) -> String {
    let bytes = match hex::decode(pattern) {
        Ok(b) => b,
        Err(_) => return pattern.to_string(),
    };

    if bytes.len() != 7 || bytes[0] != 0x07 {
        return pattern.to_string();
    }

    format!("{}-{}:{}.{}.{}*{}", bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6])
}

/// Drops the storage group (`*F`) so the code can be looked up in the description table
pub fn normalize_obis_code(code: &str) -> String {
    let code = code.trim();
    match code.split_once('*') {
        Some((base, _)) => base.to_string(),
        None => code.to_string(),
    }
}

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    let descriptions = get_standard_obis_descriptions();
    descriptions.get(normalize_obis_code(obis_code).as_str()).copied()
}

/// Human readable name of a channel's register, falls back to the raw pattern
pub fn describe_pattern(pattern: &str) -> String {
    let code = format_obis_pattern(pattern);
    match get_obis_description(&code) {
        Some(description) => format!("{} ({})", code, description),
        None => code,
    }
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Energy registers
    map.insert("1-0:1.8.0", "Active energy + (total)");
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.0", "Active energy - (total)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");

    // Power
    map.insert("1-0:16.7.0", "Sum active instantaneous power");
    map.insert("1-0:36.7.0", "Active instantaneous power (L1)");
    map.insert("1-0:56.7.0", "Active instantaneous power (L2)");
    map.insert("1-0:76.7.0", "Active instantaneous power (L3)");

    // Voltage and current
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    // Identification
    map.insert("1-0:0.0.9", "Server ID");
    map.insert("129-129:199.130.3", "Manufacturer ID");
    map.insert("1-0:96.1.0", "Device ID");

    map
}
