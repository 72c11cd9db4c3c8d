use serde_json::{Value, json};

use crate::types::DecryptedEvent;

/// Body shown in place of a message that could not be decrypted.
pub const UNABLE_TO_DECRYPT_BODY: &str =
    "** Unable to decrypt: The sender's device has not sent us the keys for this message. **";

/// Room event substituted for an undecryptable one.
pub fn unable_to_decrypt_event() -> Value {
    json!({
        "type": "m.room.message",
        "content": {
            "msgtype": "m.text",
            "body": UNABLE_TO_DECRYPT_BODY,
        }
    })
}

/// Merge plaintext over an encrypted payload and mark it decrypted.
///
/// Top-level fields of the plaintext replace the encrypted ones.
pub fn annotate_decrypted(payload: &mut Value, decrypted: &DecryptedEvent) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };

    for (key, value) in &decrypted.source {
        object.insert(key.clone(), value.clone());
    }
    object.insert("decrypted".to_owned(), Value::Bool(true));
    object.insert("verified".to_owned(), Value::Bool(decrypted.verified));
}

/// Replace the payload's type and content with the undecryptable placeholder.
pub fn annotate_undecryptable(payload: &mut Value) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };

    if let Value::Object(placeholder) = unable_to_decrypt_event() {
        object.extend(placeholder);
    }
}
