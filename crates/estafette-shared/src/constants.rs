/// Application name
pub const APP_NAME: &str = "Estafette";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag appended to every box
pub const BOX_OVERHEAD: usize = 16;

/// Blob content id size in bytes (BLAKE3 hash)
pub const BLOB_ID_SIZE: usize = 32;

/// Maximum text message size in UTF-8 bytes (can be reached quickly with
/// Unicode emojis etc.)
pub const MAX_TEXT_MESSAGE_LEN: usize = 3500;

/// Maximum media payload size in bytes (50 MiB)
pub const MAX_BLOB_SIZE: usize = 50 * 1024 * 1024;

/// Fixed nonce used for media content blobs. Safe because every message
/// uses a fresh random key.
pub const FILE_NONCE: [u8; NONCE_SIZE] = nonce_with_last_byte(0x01);

/// Fixed nonce used for thumbnail blobs, distinct from [`FILE_NONCE`] so
/// both boxes may share one key.
pub const THUMBNAIL_NONCE: [u8; NONCE_SIZE] = nonce_with_last_byte(0x02);

/// How long after `posted_at` an outgoing message may still be edited.
pub const EDIT_MESSAGES_MAX_AGE_SECS: i64 = 6 * 60 * 60;

/// How long after `posted_at` an outgoing message may still be deleted
/// for all receivers.
pub const DELETE_MESSAGES_MAX_AGE_SECS: i64 = 6 * 60 * 60;

/// Legacy acknowledge receipts map onto this reaction emoji.
pub const REACTION_ACKNOWLEDGE: &str = "\u{1F44D}";

/// Legacy decline receipts map onto this reaction emoji.
pub const REACTION_DECLINE: &str = "\u{1F44E}";

const fn nonce_with_last_byte(b: u8) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 1] = b;
    nonce
}
