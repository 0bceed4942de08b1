use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::UnknownVariant;

/// A scheduled flight. Availability is never stored on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flight {
    pub id: Uuid,
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub total_seats: i32,
    pub price: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flight {
    pub fn new(
        flight_number: impl Into<String>,
        origin: impl Into<String>,
        destination: impl Into<String>,
        departure_time: DateTime<Utc>,
        arrival_time: DateTime<Utc>,
        total_seats: i32,
        price: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flight_number: flight_number.into(),
            origin: origin.into(),
            destination: destination.into(),
            departure_time,
            arrival_time,
            total_seats,
            price,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatClass {
    #[default]
    Economy,
    Business,
    First,
}

impl SeatClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SeatClass::Economy => "ECONOMY",
            SeatClass::Business => "BUSINESS",
            SeatClass::First => "FIRST",
        }
    }
}

impl fmt::Display for SeatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatClass {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECONOMY" => Ok(SeatClass::Economy),
            "BUSINESS" => Ok(SeatClass::Business),
            "FIRST" => Ok(SeatClass::First),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A seat on exactly one flight; `seat_number` is unique per flight
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seat {
    pub id: Uuid,
    pub flight_id: Uuid,
    pub seat_number: String,
    pub seat_class: SeatClass,
    pub created_at: DateTime<Utc>,
}

impl Seat {
    pub fn new(flight_id: Uuid, seat_number: impl Into<String>, seat_class: SeatClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            flight_id,
            seat_number: seat_number.into(),
            seat_class,
            created_at: Utc::now(),
        }
    }
}
