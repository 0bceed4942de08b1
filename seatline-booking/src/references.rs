use uuid::Uuid;

/// Attempts before giving up on finding an unused booking reference.
pub const MAX_REFERENCE_ATTEMPTS: usize = 5;

fn random_hex(len: usize) -> String {
    let mut hex = Uuid::new_v4().simple().to_string().to_uppercase();
    hex.truncate(len);
    hex
}

/// `BK` followed by 8 upper-case hex characters
pub fn booking_reference() -> String {
    format!("BK{}", random_hex(8))
}

/// `TXN` followed by 10 upper-case hex characters
pub fn transaction_id() -> String {
    format!("TXN{}", random_hex(10))
}

/// `REF` followed by 10 upper-case hex characters
pub fn refund_reference() -> String {
    format!("REF{}", random_hex(10))
}
