use regex::Regex;

/// Totals line of a Consignment Note, numbers kept as normalised strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipmentTotal {
    pub packages: String,
    pub gross_weight_kg: String,
    pub volume_m3: String,
}

impl ShipmentTotal {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.gross_weight_kg.is_empty() && self.volume_m3.is_empty()
    }
}

/// CN identifier: a 6-12 digit number shortly after "consignment note",
/// else the first standalone 8-digit number on the page.
pub fn find_cn_number(text: &str) -> Option<String> {
    let re = Regex::new(r"(?i)consignment\s+note[^0-9]{0,50}(\d{6,12})").ok()?;
    if let Some(cap) = re.captures(text) {
        return Some(cap[1].to_string());
    }

    let fallback = Regex::new(r"\b(\d{8})\b").ok()?;
    fallback.captures(text).map(|c| c[1].to_string())
}

/// "Shipment total: 6colli 1478,0 6,432"
pub fn parse_shipment_total(text: &str) -> Option<ShipmentTotal> {
    let re = Regex::new(
        r"(?i)shipment\s+total:\s*(\d+)\s*colli\s+([0-9][0-9.,]*)\s+([0-9][0-9.,]*)",
    )
    .ok()?;
    let cap = re.captures(text)?;
    Some(ShipmentTotal {
        packages: cap[1].trim().to_string(),
        gross_weight_kg: decimal_with_dot(&cap[2]),
        volume_m3: decimal_with_dot(&cap[3]),
    })
}

/// 8-digit HS codes written after a "...BP<digits> CZ" identifier,
/// e.g. "QBP3123 CZ 85472000". Repeats are line items and are kept.
pub fn extract_hs_codes(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r"(?i)\b[0-9A-Z]*BP\d+\s+CZ\s+(\d{8})\b") else {
        return Vec::new();
    };
    re.captures_iter(text).map(|c| c[1].to_string()).collect()
}

fn decimal_with_dot(raw: &str) -> String {
    raw.trim().replace(' ', "").replace(',', ".")
}
