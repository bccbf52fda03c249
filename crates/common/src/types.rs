// Domain types shared by the sync client, its adapters and tools.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned user identifier.
pub type UserId = i64;

/// Server-assigned chat message identifier.
pub type MessageId = i64;

/// Identity of a shared record (order, task, chat message, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Authoritative id assigned by the server.
    Remote(i64),
    /// Placeholder for an optimistic insert the server has not confirmed yet.
    Local(Uuid),
}

impl RecordId {
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Remote(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

/// One user as reported by the presence pull endpoint or a `presence:update` push.
///
/// Every field except `id` is optional so a push entry can carry a partial
/// overlay; absent fields never override a pulled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, alias = "online", skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(
        default,
        alias = "lastActive",
        with = "lenient_utc",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceSession>,
}

impl PresenceUser {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: None,
            full_name: None,
            avatar: None,
            is_online: None,
            last_active: None,
            presence: Vec::new(),
        }
    }

    /// Name to show for this user: full name, then username, then a placeholder.
    pub fn display_name(&self) -> String {
        [self.full_name.as_deref(), self.username.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("User {}", self.id))
    }
}

/// A single client session backing a user's presence (one per device/tab).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, with = "lenient_utc", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Timestamps from the server are RFC 3339 or naive ISO-8601 in UTC.
mod lenient_utc {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_some(&value.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(parsed.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn record_id_round_trips_remote_and_local() {
        let remote: RecordId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(remote, RecordId::Remote(42));

        let local = RecordId::new_local();
        let encoded = serde_json::to_value(&local).unwrap();
        assert!(encoded.is_string());
        let decoded: RecordId = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, local);
        assert!(decoded.is_local());
    }

    #[test]
    fn presence_user_accepts_naive_timestamps() {
        let user: PresenceUser = serde_json::from_value(json!({
            "id": 7,
            "username": "ayse",
            "is_online": true,
            "last_active": "2026-03-01T10:15:30.250000",
            "presence": [
                {"session_id": "tab-1", "client_type": "browser", "last_seen": "2026-03-01T10:15:30"}
            ]
        }))
        .unwrap();

        assert_eq!(
            user.last_active,
            Some(
                Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap()
                    + chrono::Duration::milliseconds(250)
            )
        );
        assert_eq!(
            user.presence[0].last_seen,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap())
        );
    }

    #[test]
    fn presence_user_accepts_push_aliases() {
        let user: PresenceUser = serde_json::from_value(json!({
            "id": 1,
            "online": true,
            "lastActive": "2026-03-01T10:15:30Z"
        }))
        .unwrap();
        assert_eq!(user.is_online, Some(true));
        assert!(user.last_active.is_some());
        assert!(user.presence.is_empty());
    }

    #[test]
    fn display_name_falls_back_in_order() {
        let mut user = PresenceUser::new(3);
        assert_eq!(user.display_name(), "User 3");

        user.username = Some("mert".into());
        assert_eq!(user.display_name(), "mert");

        user.full_name = Some("  ".into());
        assert_eq!(user.display_name(), "mert");

        user.full_name = Some("Mert Kaya".into());
        assert_eq!(user.display_name(), "Mert Kaya");
    }
}
