//! Device Action Declarations
//!
//! The function declarations advertised to the upstream session when actions
//! are enabled. Names follow the `control_<domain>` convention understood by
//! [`crate::device_backend::HomeAssistantBackend::plan`].

use serde_json::{Value, json};

fn control(domain: &str, description: &str, actions: &[&str]) -> Value {
    json!({
        "name": format!("control_{domain}"),
        "description": description,
        "parameters": {
            "type": "object",
            "properties": {
                "entity_id": {
                    "type": "string",
                    "description": format!("The {domain} entity id, e.g. {domain}.living_room")
                },
                "action": { "type": "string", "enum": actions }
            },
            "required": ["entity_id", "action"]
        }
    })
}

/// Returns every action declaration known to this crate.
pub fn declarations() -> Vec<Value> {
    vec![
        control(
            "light",
            "Turn a light on or off, or toggle it.",
            &["turn_on", "turn_off", "toggle"],
        ),
        control(
            "switch",
            "Turn a switch on or off, or toggle it.",
            &["turn_on", "turn_off", "toggle"],
        ),
        control(
            "climate",
            "Control a thermostat or air conditioner.",
            &["turn_on", "turn_off", "set_temperature", "set_hvac_mode"],
        ),
        control(
            "cover",
            "Open, close or stop a blind, shutter or garage door.",
            &["open_cover", "close_cover", "stop_cover", "set_cover_position"],
        ),
        control("lock", "Lock or unlock a door lock.", &["lock", "unlock"]),
        json!({
            "name": "activate_scene",
            "description": "Activate a predefined scene.",
            "parameters": {
                "type": "object",
                "properties": { "entity_id": { "type": "string" } },
                "required": ["entity_id"]
            }
        }),
        json!({
            "name": "get_entity_state",
            "description": "Read the current state of any entity.",
            "parameters": {
                "type": "object",
                "properties": { "entity_id": { "type": "string" } },
                "required": ["entity_id"]
            }
        }),
        json!({
            "name": "list_entities",
            "description": "List known entities, optionally filtered by domain.",
            "parameters": {
                "type": "object",
                "properties": { "domain": { "type": "string" } }
            }
        }),
    ]
}
