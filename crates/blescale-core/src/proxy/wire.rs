//! Payloads and topic names exchanged with the remote radio.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use blescale_types::{DeviceInfo, uuids};

use crate::advertisement::{AddressType, Advertisement};

/// One device from a `scan/results` message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScanEntry {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rssi: Option<i16>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub manufacturer_id: Option<u16>,
    /// Hex-encoded payload following the company id.
    #[serde(default)]
    pub manufacturer_data: Option<String>,
    #[serde(default)]
    pub addr_type: Option<u8>,
}

impl ScanEntry {
    /// Convert to an [`Advertisement`], skipping service ids and payloads
    /// that do not parse.
    pub fn into_advertisement(self) -> Advertisement {
        let mut info = DeviceInfo::new();
        if !self.name.is_empty() {
            info = info.with_name(self.name);
        }
        for raw in &self.services {
            match uuids::normalize(raw) {
                Some(uuid) => info = info.with_service(uuid),
                None => debug!(address = %self.address, "Ignoring malformed service id {:?}", raw),
            }
        }
        if let (Some(company_id), Some(payload)) = (self.manufacturer_id, &self.manufacturer_data) {
            match hex::decode(payload) {
                Ok(data) => info = info.with_manufacturer(company_id, data),
                Err(e) => debug!(address = %self.address, "Ignoring manufacturer data: {}", e),
            }
        }

        let mut advertisement = Advertisement::new(self.address, info);
        if let Some(rssi) = self.rssi {
            advertisement = advertisement.with_rssi(rssi);
        }
        if let Some(addr_type) = self.addr_type {
            advertisement = advertisement.with_address_type(AddressType::from_wire(addr_type));
        }
        advertisement
    }
}

/// Decode a `scan/results` payload into one advertisement batch.
pub fn parse_scan_results(payload: &[u8]) -> serde_json::Result<Vec<Advertisement>> {
    let entries: Vec<ScanEntry> = serde_json::from_slice(payload)?;
    Ok(entries
        .into_iter()
        .map(ScanEntry::into_advertisement)
        .collect())
}

/// Body of a `connect` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectRequest<'a> {
    pub address: &'a str,
    pub addr_type: u8,
}

/// One characteristic listed in a `connected` message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: String,
    #[serde(default)]
    pub properties: Vec<String>,
}

impl CharacteristicInfo {
    pub fn can_notify(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p == "notify" || p == "indicate")
    }
}

/// Body of a `connected` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Connected {
    #[serde(default)]
    pub chars: Vec<CharacteristicInfo>,
}

impl Connected {
    /// Characteristic UUIDs that parsed.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.chars
            .iter()
            .filter_map(|c| uuids::normalize(&c.uuid))
            .collect()
    }
}

/// Inbound topics, relative to the device base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Status,
    ScanResults,
    Connected,
    Disconnected,
    Notify(Uuid),
    ReadResponse(Uuid),
    Error,
}

impl Inbound {
    /// Classify `topic` if it lives under `base`.
    pub fn parse(base: &str, topic: &str) -> Option<Self> {
        let suffix = topic.strip_prefix(base)?.strip_prefix('/')?;
        match suffix {
            "status" => return Some(Inbound::Status),
            "scan/results" => return Some(Inbound::ScanResults),
            "connected" => return Some(Inbound::Connected),
            "disconnected" => return Some(Inbound::Disconnected),
            "error" => return Some(Inbound::Error),
            _ => {}
        }
        if let Some(id) = suffix.strip_prefix("notify/") {
            return uuids::normalize(id).map(Inbound::Notify);
        }
        let id = suffix.strip_prefix("read/")?.strip_suffix("/response")?;
        uuids::normalize(id).map(Inbound::ReadResponse)
    }

    /// Subscription filters covering every inbound topic.
    pub fn filters(base: &str) -> Vec<String> {
        [
            "status",
            "scan/results",
            "connected",
            "disconnected",
            "notify/+",
            "read/+/response",
            "error",
        ]
        .iter()
        .map(|suffix| format!("{base}/{suffix}"))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "blescale/bridge-1";

    #[test]
    fn test_parse_scan_results() {
        let payload = br#"[
            {"address": "AA:BB:CC:DD:EE:FF", "name": "QN-Scale", "rssi": -61,
             "services": ["ffe0"], "addr_type": 1},
            {"address": "11:22:33:44:55:66", "name": "", "rssi": -80, "services": [],
             "manufacturer_id": 343, "manufacturer_data": "0a0b0c", "addr_type": 0}
        ]"#;
        let batch = parse_scan_results(payload).unwrap();
        assert_eq!(batch.len(), 2);

        assert_eq!(batch[0].info.name.as_deref(), Some("QN-Scale"));
        assert!(batch[0].info.has_service(&uuids::QN_SERVICE));
        assert_eq!(batch[0].rssi, Some(-61));
        assert_eq!(batch[0].address_type, Some(AddressType::Random));

        let mfr = batch[1].info.manufacturer.as_ref().unwrap();
        assert_eq!(mfr.company_id, 343);
        assert_eq!(mfr.data, vec![0x0a, 0x0b, 0x0c]);
        assert_eq!(batch[1].info.name, None);
        assert!(batch[1].info.service_data.is_empty());
    }

    #[test]
    fn test_scan_entry_skips_garbage() {
        let entry = ScanEntry {
            address: "AA".into(),
            services: vec!["not-a-uuid".into(), "0000181d00001000800000805f9b34fb".into()],
            manufacturer_id: Some(1),
            manufacturer_data: Some("zz".into()),
            ..Default::default()
        };
        let advertisement = entry.into_advertisement();
        assert_eq!(advertisement.info.services.len(), 1);
        assert!(advertisement.info.has_service(&uuids::WEIGHT_SCALE_SERVICE));
        assert!(advertisement.info.manufacturer.is_none());
    }

    #[test]
    fn test_malformed_scan_results() {
        assert!(parse_scan_results(b"{not json").is_err());
        assert!(parse_scan_results(br#"[{"name": "no address"}]"#).is_err());
    }

    #[test]
    fn test_connected_payload() {
        let connected: Connected = serde_json::from_str(
            r#"{"chars": [
                {"uuid": "0000ffe100001000800000805f9b34fb", "properties": ["notify"]},
                {"uuid": "0000ffe300001000800000805f9b34fb", "properties": ["write", "write-without-response"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(connected.uuids(), vec![uuids::QN_NOTIFY, uuids::QN_WRITE]);
        assert!(connected.chars[0].can_notify());
        assert!(!connected.chars[1].can_notify());
    }

    #[test]
    fn test_connect_request_json() {
        let request = ConnectRequest {
            address: "AA:BB:CC:DD:EE:FF",
            addr_type: 1,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"address":"AA:BB:CC:DD:EE:FF","addr_type":1}"#
        );
    }

    #[test]
    fn test_inbound_topics() {
        let notify = format!("{BASE}/notify/{}", uuids::to_wire(&uuids::QN_NOTIFY));
        let response = format!("{BASE}/read/{}/response", uuids::to_wire(&uuids::QN_WRITE));

        assert_eq!(Inbound::parse(BASE, &format!("{BASE}/status")), Some(Inbound::Status));
        assert_eq!(
            Inbound::parse(BASE, &format!("{BASE}/scan/results")),
            Some(Inbound::ScanResults)
        );
        assert_eq!(Inbound::parse(BASE, &notify), Some(Inbound::Notify(uuids::QN_NOTIFY)));
        assert_eq!(
            Inbound::parse(BASE, &response),
            Some(Inbound::ReadResponse(uuids::QN_WRITE))
        );
        assert_eq!(Inbound::parse(BASE, "blescale/other/status"), None);
        assert_eq!(Inbound::parse(BASE, &format!("{BASE}/read/ffe1")), None);
        assert_eq!(Inbound::parse(BASE, &format!("{BASE}statusx")), None);
    }

    #[test]
    fn test_filters() {
        let filters = Inbound::filters(BASE);
        assert!(filters.contains(&format!("{BASE}/notify/+")));
        assert!(filters.contains(&format!("{BASE}/read/+/response")));
        assert_eq!(filters.len(), 7);
    }
}
