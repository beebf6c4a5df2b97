//! Pixel chip and colour order tables shared by families.

/// Addressable chip types, indexed by wire code.
pub const CHIP_TYPES: [&str; 27] = [
    "SM16703",
    "TM1804",
    "UCS1903",
    "WS2811",
    "WS2801",
    "SK6812",
    "LPD6803",
    "LPD8806",
    "APA102",
    "APA105",
    "DMX512",
    "TM1914",
    "TM1913",
    "P9813",
    "INK1003",
    "P943S",
    "P9411",
    "P9413",
    "TX1812",
    "TX1813",
    "GS8206",
    "GS8208",
    "SK9822",
    "TM1814",
    "SK6812_RGBW",
    "P9414",
    "P9412",
];

/// First chip code driving a white channel.
pub const FIRST_RGBW_CHIP: u8 = 0x17;

/// Three channel colour orders.
pub const RGB_ORDERS: [&str; 6] = ["RGB", "RBG", "GRB", "GBR", "BRG", "BGR"];

/// Four channel colour orders.
pub const RGBW_ORDERS: [&str; 17] = [
    "RGBW", "RBGW", "GRBW", "GBRW", "BRGW", "BGRW", "RGWB", "RBWG", "RWGB", "RWBG", "GRWB", "GBWR",
    "GWRB", "GWBR", "BRWG", "BGWR", "BWRG",
];

/// Cold/warm white orders.
pub const CCT_ORDERS: [&str; 2] = ["CW", "WC"];

/// Name of a table entry.
#[must_use]
pub fn name(table: &[&'static str], code: u8) -> Option<&'static str> {
    table.get(usize::from(code)).copied()
}

/// Wire code of a table entry.
#[must_use]
pub fn code(table: &[&str], name: &str) -> Option<u8> {
    table
        .iter()
        .position(|entry| entry.eq_ignore_ascii_case(name))
        .and_then(|index| u8::try_from(index).ok())
}

/// Returns true if the chip drives a white channel.
#[must_use]
pub fn is_rgbw_chip(code: u8) -> bool {
    (FIRST_RGBW_CHIP..=0x1A).contains(&code)
}

/// Colour order table for a chip type.
#[must_use]
pub fn orders_for(chip: u8) -> &'static [&'static str] {
    if is_rgbw_chip(chip) {
        &RGBW_ORDERS
    } else {
        &RGB_ORDERS
    }
}

/// Owned list of table names, for option queries.
#[must_use]
pub fn names(table: &[&str]) -> Vec<String> {
    table.iter().map(|entry| (*entry).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_lookup() {
        assert_eq!(name(&CHIP_TYPES, 0x03), Some("WS2811"));
        assert_eq!(name(&CHIP_TYPES, 0x18), Some("SK6812_RGBW"));
        assert_eq!(name(&CHIP_TYPES, 0x40), None);
        assert_eq!(code(&CHIP_TYPES, "ws2811"), Some(0x03));
    }

    #[test]
    fn test_orders_follow_chip() {
        assert!(is_rgbw_chip(0x17));
        assert!(is_rgbw_chip(0x1A));
        assert!(!is_rgbw_chip(0x16));
        assert_eq!(orders_for(0x18).len(), 17);
        assert_eq!(name(orders_for(0x03), 2), Some("GRB"));
        assert_eq!(code(&RGBW_ORDERS, "BWRG"), Some(0x10));
    }
}
