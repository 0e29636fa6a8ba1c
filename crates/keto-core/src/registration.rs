/// Tag value marking a registration token as consumed.
pub const CLAIMED_TAG_VALUE: &str = "Success";

/// Default name of the registration tag.
pub const DEFAULT_TAG_NAME: &str = "KubeletToken";

/// Protocol state carried by a node's registration tag.
///
/// The raw tag is overloaded: absent, a live token, or the sentinel. Only the
/// tag-store adapter converts between this and raw values.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// No token issued yet.
    Absent,
    /// A token has been offered and not yet claimed.
    Offered(String),
    /// The token was claimed; nothing may be reissued or accepted again.
    Claimed,
}

impl RegistrationState {
    pub fn from_tag_value(value: Option<&str>) -> Self {
        match value {
            None => RegistrationState::Absent,
            Some(CLAIMED_TAG_VALUE) => RegistrationState::Claimed,
            Some(token) => RegistrationState::Offered(token.to_string()),
        }
    }

    /// The raw value to store, or `None` for `Absent`.
    pub fn tag_value(&self) -> Option<&str> {
        match self {
            RegistrationState::Absent => None,
            RegistrationState::Offered(token) => Some(token),
            RegistrationState::Claimed => Some(CLAIMED_TAG_VALUE),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, RegistrationState::Absent)
    }
}

impl std::fmt::Debug for RegistrationState {
    // Offered tokens are credentials; keep them out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Absent => f.write_str("Absent"),
            RegistrationState::Offered(_) => f.write_str("Offered(..)"),
            RegistrationState::Claimed => f.write_str("Claimed"),
        }
    }
}
