use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("hardware address must have 6 octets, got {0}")]
    OctetCount(usize),
    #[error("invalid hardware address octet `{0}`")]
    InvalidOctet(String),
}

/// Stable identifiers derived from the network interface hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
    controller_id: String,
    compact_id: String,
    device_name: String,
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6], name_prefix: &str) -> Self {
        let octets: Vec<String> = mac.iter().map(|octet| format!("{octet:02X}")).collect();
        let device_name = format!("{name_prefix}_{}", octets[3..].concat());
        Self {
            mac,
            controller_id: octets.join(":"),
            compact_id: octets.concat(),
            device_name,
        }
    }

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-...` or twelve bare hex digits.
    pub fn parse(text: &str, name_prefix: &str) -> Result<Self, IdentityError> {
        let trimmed = text.trim();
        let parts: Vec<&str> = if trimmed.contains([':', '-']) {
            trimmed.split([':', '-']).collect()
        } else if trimmed.len() == 12 && trimmed.is_ascii() {
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(IdentityError::OctetCount(0));
        };

        if parts.len() != 6 {
            return Err(IdentityError::OctetCount(parts.len()));
        }

        let mut mac = [0u8; 6];
        for (slot, part) in mac.iter_mut().zip(parts) {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(IdentityError::InvalidOctet(part.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| IdentityError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self::from_mac(mac, name_prefix))
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Upper-case, colon separated. Used for registration.
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Separator-free form used in topics and query strings.
    pub fn compact_id(&self) -> &str {
        &self.compact_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn client_id(&self) -> String {
        format!("esp32-{}", self.compact_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_all_forms_from_mac() {
        let identity = DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xa1, 0xb2, 0x0c], "ESP32");

        assert_eq!(identity.controller_id(), "24:6F:28:A1:B2:0C");
        assert_eq!(identity.compact_id(), "246F28A1B20C");
        assert_eq!(identity.device_name(), "ESP32_A1B20C");
        assert_eq!(identity.client_id(), "esp32-246F28A1B20C");
    }

    #[test]
    fn compact_id_has_no_separators() {
        let identity = DeviceIdentity::parse("de-ad-be-ef-00-01", "Node").unwrap();
        assert!(!identity.compact_id().contains([':', '-']));
        assert_eq!(identity.compact_id().len(), 12);
        assert_eq!(
            identity,
            DeviceIdentity::parse("DEADBEEF0001", "Node").unwrap()
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(
            DeviceIdentity::parse("aa:bb:cc", "x"),
            Err(IdentityError::OctetCount(3))
        );
        assert_eq!(
            DeviceIdentity::parse("aa:bb:cc:dd:ee:zz", "x"),
            Err(IdentityError::InvalidOctet("zz".to_string()))
        );
        assert_eq!(
            DeviceIdentity::parse("+f:bb:cc:dd:ee:ff", "x"),
            Err(IdentityError::InvalidOctet("+f".to_string()))
        );
    }
}
