// Configuration loading and per-subsystem validation
pub mod config;

// Echo suppression between the two bridge directions
pub mod guard;

// Persisted control selection
pub mod selection;

// Structure file loading and state resolution
pub mod loxone;

// Outbound message rendering
pub mod message;

// MQTT broker integration
pub mod mqtt;

// Broker <-> datagram forwarding
pub mod bridge;

// Periodic publisher for selected controls
pub mod poller;

// Selection viewer HTTP API
pub mod viewer;
