use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::bid::SongSelection;
use crate::models::event::EventId;
use crate::models::wallet::WalletId;

/// Validated bid submission payload. Unknown fields are rejected at the
/// deserialization boundary so malformed shapes never reach the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateBidRequest {
    pub event_id: EventId,
    pub wallet_id: WalletId,
    pub song_title: String,
    #[serde(default)]
    pub song_artist: Option<String>,
    #[serde(default)]
    pub song_album: Option<String>,
    #[serde(default)]
    pub external_track_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub user_name: Option<String>,
}

impl CreateBidRequest {
    pub fn validate(&self, min_bid_amount: Decimal) -> Result<(), EngineError> {
        if self.song_title.trim().is_empty() {
            return Err(EngineError::Validation("song title is required".to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(EngineError::Validation("bid amount must be positive".to_string()));
        }
        if self.amount < min_bid_amount {
            return Err(EngineError::Validation(format!(
                "bid amount {} is below the minimum {}",
                self.amount, min_bid_amount
            )));
        }
        Ok(())
    }

    pub fn song(&self) -> SongSelection {
        SongSelection {
            title: self.song_title.trim().to_string(),
            artist: self.song_artist.clone(),
            album: self.song_album.clone(),
            external_track_id: self.external_track_id.clone(),
            message: self.message.clone(),
        }
    }

    pub fn bidder_name(&self) -> String {
        self.user_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("Anonymous")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(title: &str, amount: i64) -> CreateBidRequest {
        CreateBidRequest {
            event_id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            song_title: title.to_string(),
            song_artist: None,
            song_album: None,
            external_track_id: None,
            message: None,
            amount: Decimal::from(amount),
            user_name: None,
        }
    }

    #[test]
    fn test_title_required() {
        let err = request("   ", 100).validate(Decimal::from(50)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_minimum_amount() {
        assert!(request("Song", 49).validate(Decimal::from(50)).is_err());
        assert!(request("Song", 50).validate(Decimal::from(50)).is_ok());
    }

    #[test]
    fn test_anonymous_bidder_fallback() {
        assert_eq!(request("Song", 100).bidder_name(), "Anonymous");

        let mut req = request("Song", 100);
        req.user_name = Some("  Priya  ".to_string());
        assert_eq!(req.bidder_name(), "Priya");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = format!(
            r#"{{"event_id":"{}","wallet_id":"{}","song_title":"X","amount":60,"hax":1}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert!(serde_json::from_str::<CreateBidRequest>(&json).is_err());
    }
}
