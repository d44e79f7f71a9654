// src/registry.rs
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// A command handler: receives the argument bytes and writes the response
/// payload. Whatever it leaves in the response is framed and sent verbatim.
pub type Handler = Arc<dyn Fn(&[u8], &mut Vec<u8>) + Send + Sync>;

/// Name-to-handler map. Insertion-heavy before `start()`, read-mostly after;
/// every lookup takes the mutex, so registration during operation stays
/// safe, just not lock-free.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        command: impl Into<String>,
        handler: impl Fn(&[u8], &mut Vec<u8>) + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.into(), Arc::new(handler));
    }

    pub fn lookup(&self, command: &str) -> Option<Handler> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
    }

    /// Resolve and invoke the handler for a request payload
    /// (`u8 cmd_length`, command, args), writing the response payload.
    ///
    /// Malformed payloads, unknown commands, and handler panics all surface
    /// as `ERROR: ...` responses; the frame is never silently dropped.
    pub fn dispatch(&self, payload: &[u8], response: &mut Vec<u8>) {
        response.clear();

        if payload.is_empty() {
            response.extend_from_slice(b"ERROR: Empty request");
            return;
        }

        let command_len = payload[0] as usize;
        if payload.len() < command_len + 1 {
            response.extend_from_slice(b"ERROR: Invalid request format");
            return;
        }

        // Command names are matched as bytes; anything that is not a
        // registered name, valid UTF-8 or not, falls through to the
        // unknown-command response.
        let command = String::from_utf8_lossy(&payload[1..1 + command_len]);
        let args = &payload[1 + command_len..];

        // The handler runs outside the lock; a slow command must not stall
        // other workers' lookups.
        let Some(handler) = self.lookup(&command) else {
            response.extend_from_slice(format!("ERROR: Unknown command: {command}").as_bytes());
            return;
        };

        if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(|| handler(args, response))) {
            let message = panic_message(cause.as_ref());
            tracing::error!(command = %command, message, "handler panicked");
            response.clear();
            response.extend_from_slice(format!("ERROR: {message}").as_bytes());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "handler panicked"
    }
}
