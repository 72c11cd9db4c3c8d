//! Accessors over server response bodies.
//!
//! Missing sections are treated as empty so that partial bodies pass through
//! untouched.

use serde_json::Value;

/// Timeline events of a joined room inside a sync body.
#[derive(Debug)]
pub struct RoomTimeline<'a> {
    pub room_id: &'a str,
    pub events: &'a mut Vec<Value>,
}

/// Every `rooms.join.<room_id>.timeline.events` list of a sync body.
pub fn joined_room_timelines(body: &mut Value) -> Vec<RoomTimeline<'_>> {
    let Some(joined) = body
        .pointer_mut("/rooms/join")
        .and_then(Value::as_object_mut)
    else {
        return Vec::new();
    };

    joined
        .iter_mut()
        .filter_map(|(room_id, room)| {
            let events = room
                .pointer_mut("/timeline/events")
                .and_then(Value::as_array_mut)?;
            Some(RoomTimeline {
                room_id: room_id.as_str(),
                events,
            })
        })
        .collect()
}

/// The `chunk` list of a `/messages` body.
pub fn messages_chunk(body: &mut Value) -> Option<&mut Vec<Value>> {
    body.get_mut("chunk").and_then(Value::as_array_mut)
}
