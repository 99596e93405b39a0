use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a car reservation.
///
/// Wraps a UUID so reservation ids can't be mixed up with other
/// UUID-based identifiers. Every downstream call and every awaited
/// completion event is correlated on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random reservation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a reservation ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The all-zero ID, used where no reservation is known.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReservationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for ReservationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ReservationId> for Uuid {
    fn from(id: ReservationId) -> Self {
        id.0
    }
}

/// Errors raised when a reservation request is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("customer name must not be empty")]
    EmptyCustomerName,

    #[error("car class must not be empty")]
    EmptyCarClass,
}

/// Identity of a reservation: who reserved which class of car.
///
/// Immutable once a saga starts for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub reservation_id: ReservationId,
    pub customer_name: String,
    pub car_class: String,
}

impl ReservationInfo {
    /// Builds a validated reservation for an existing ID.
    pub fn new(
        reservation_id: ReservationId,
        customer_name: impl Into<String>,
        car_class: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let info = Self {
            reservation_id,
            customer_name: customer_name.into(),
            car_class: car_class.into(),
        };
        info.validate()?;
        Ok(info)
    }

    /// Builds a validated reservation with a server-generated ID.
    pub fn generate(
        customer_name: impl Into<String>,
        car_class: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(ReservationId::new(), customer_name, car_class)
    }

    /// Checks the invariants of a reservation that arrived from outside
    /// (for example, deserialized from a request).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.customer_name.trim().is_empty() {
            return Err(ValidationError::EmptyCustomerName);
        }
        if self.car_class.trim().is_empty() {
            return Err(ValidationError::EmptyCarClass);
        }
        Ok(())
    }
}

/// Completion payload reported by a downstream service for one operation.
///
/// The default value (nil id, `success == false`) doubles as the degraded
/// result a step returns after exhausting its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOperationResult {
    pub reservation_id: ReservationId,
    pub success: bool,
}

impl Default for ReservationOperationResult {
    fn default() -> Self {
        Self::failed(ReservationId::nil())
    }
}

impl ReservationOperationResult {
    pub fn succeeded(reservation_id: ReservationId) -> Self {
        Self {
            reservation_id,
            success: true,
        }
    }

    pub fn failed(reservation_id: ReservationId) -> Self {
        Self {
            reservation_id,
            success: false,
        }
    }
}

/// Identifies one attempt of a saga step.
///
/// Tokens increase monotonically within a reservation. A completion event
/// echoing an older token belongs to an attempt that already gave up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AttemptToken(u64);

impl AttemptToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_id_new_creates_unique_ids() {
        let id1 = ReservationId::new();
        let id2 = ReservationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn reservation_id_parses_from_string() {
        let id = ReservationId::new();
        let parsed: ReservationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ReservationId>().is_err());
    }

    #[test]
    fn reservation_id_serializes_as_plain_uuid() {
        let uuid = Uuid::new_v4();
        let id = ReservationId::from_uuid(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn reservation_info_rejects_blank_fields() {
        assert_eq!(
            ReservationInfo::generate("  ", "SUV").unwrap_err(),
            ValidationError::EmptyCustomerName
        );
        assert_eq!(
            ReservationInfo::generate("Alice", "").unwrap_err(),
            ValidationError::EmptyCarClass
        );
        assert!(ReservationInfo::generate("Alice", "SUV").is_ok());
    }

    #[test]
    fn deserialized_info_can_be_validated() {
        let json = r#"{"reservation_id":"6f1c2a36-5cf5-4b8e-9a52-0f0b8f7a0b11","customer_name":"","car_class":"Compact"}"#;
        let info: ReservationInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.validate(), Err(ValidationError::EmptyCustomerName));
    }

    #[test]
    fn default_operation_result_is_a_failure() {
        let result = ReservationOperationResult::default();
        assert!(!result.success);
        assert!(result.reservation_id.as_uuid().is_nil());
    }

    #[test]
    fn attempt_tokens_are_ordered() {
        let first = AttemptToken::new(1);
        assert!(first.next() > first);
        assert_eq!(first.next().as_u64(), 2);
    }
}
