//! Decryption pipeline over intercepted response bodies, plus the outbound
//! encrypt-with-retry path.
//!
//! Every function here runs to completion without suspending, except
//! [`encrypt_with_session_retry`] which may have to share a group session.

use relay_core::{
    CryptoEngine, CryptoError, DecryptionError, EncryptedEvent, EventParseError,
    annotate_decrypted, annotate_undecryptable, event::is_encrypted, joined_room_timelines,
    messages_chunk,
};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Decrypt one event payload in place.
///
/// Returns `Ok(true)` when plaintext was merged in and `Ok(false)` when the
/// payload is not a megolm event or decryption failed with
/// `ignore_failures` set. Only a decryption failure with `ignore_failures`
/// cleared surfaces as an error.
pub fn decrypt_event(
    engine: &dyn CryptoEngine,
    payload: &mut Value,
    room_id_hint: Option<&str>,
    ignore_failures: bool,
) -> Result<bool, DecryptionError> {
    let mut event = match EncryptedEvent::parse(payload) {
        Ok(event) => event,
        Err(EventParseError::NotEncrypted(kind)) => {
            warn!(event_type = %kind, "event is not encrypted; leaving it untouched");
            return Ok(false);
        }
        Err(err) => {
            warn!(error = %err, "encrypted event is not a megolm event");
            return Ok(false);
        }
    };

    if event.room_id.is_none() {
        event.room_id = room_id_hint.map(str::to_owned);
    }

    match engine.decrypt(&event) {
        Ok(decrypted) => {
            debug!(
                event_id = event.event_id.as_deref().unwrap_or_default(),
                room_id = event.room_id.as_deref().unwrap_or_default(),
                verified = decrypted.verified,
                "decrypted event"
            );
            annotate_decrypted(payload, &decrypted);
            Ok(true)
        }
        Err(err) => {
            warn!(
                event_id = event.event_id.as_deref().unwrap_or_default(),
                session_id = event.session_id(),
                error = %err,
                "failed to decrypt event"
            );
            if !ignore_failures {
                return Err(err);
            }
            annotate_undecryptable(payload);
            Ok(false)
        }
    }
}

/// Decrypt the encrypted events of a `/messages` body.
///
/// Failures are replaced with the placeholder; a body without `chunk` is
/// left as is.
pub fn decrypt_messages_body(engine: &dyn CryptoEngine, body: &mut Value) {
    let Some(chunk) = messages_chunk(body) else {
        return;
    };

    info!(events = chunk.len(), "decrypting room messages");
    for event in chunk.iter_mut() {
        if !is_encrypted(event) {
            continue;
        }
        // ignore_failures is set, so this cannot return an error.
        let _ = decrypt_event(engine, event, None, true);
    }
}

/// Decrypt the timeline events of every joined, known, encrypted room in a
/// `/sync` body.
pub fn decrypt_sync_body(
    engine: &dyn CryptoEngine,
    body: &mut Value,
    ignore_failures: bool,
) -> Result<(), DecryptionError> {
    debug!("decrypting sync body");

    for timeline in joined_room_timelines(body) {
        let room_id = timeline.room_id;
        match engine.room(room_id) {
            None => {
                info!(room_id, "unknown room; skipping");
                continue;
            }
            Some(room) if !room.encrypted => {
                info!(room_id, room = %room.display_name, "room is not encrypted; skipping");
                continue;
            }
            Some(_) => {}
        }

        for event in timeline.events.iter_mut().filter(|event| is_encrypted(event)) {
            decrypt_event(engine, event, Some(room_id), ignore_failures)?;
        }
    }

    Ok(())
}

/// Encrypt room content, sharing a group session and retrying once if the
/// room has none yet.
pub async fn encrypt_with_session_retry(
    engine: &dyn CryptoEngine,
    room_id: &str,
    event_type: &str,
    content: &Value,
) -> Result<Value, CryptoError> {
    match engine.encrypt(room_id, event_type, content) {
        Err(CryptoError::GroupSessionMissing { .. }) => {
            info!(room_id, "no outbound group session; sharing one");
            engine.share_group_session(room_id).await?;
            engine.encrypt(room_id, event_type, content)
        }
        other => other,
    }
}
