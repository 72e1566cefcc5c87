//! Fake device driver for exercising the control bus without hardware.
//!
//! Registers stand-in handlers for the keys the real driver publishes and
//! runs the agent against the control socket. Point a socket server at the
//! same path and drive it with lines like:
//!
//! ```text
//! {"get": {"all": null}}
//! {"set": {"display_mode": "snakes"}}
//! ```
//!
//! Usage: `driver_dummy [socket-path]` (default `/tmp/led_display.sock`).

use std::sync::{Arc, Mutex};

use pixelbus::{Agent, HandlerEntry, UnixTransport};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn string_cell(initial: &str) -> (Arc<Mutex<String>>, HandlerEntry) {
    let cell = Arc::new(Mutex::new(initial.to_string()));
    let set_cell = cell.clone();
    let get_cell = cell.clone();
    let entry = HandlerEntry::new()
        .on_set(move |v: Value| {
            let cell = set_cell.clone();
            async move {
                if let Some(s) = v.as_str() {
                    info!("setting: {}", s);
                    *cell.lock().unwrap() = s.to_string();
                }
                Ok(())
            }
        })
        .on_get(move |_arg: Option<&Value>| Ok(json!(*get_cell.lock().unwrap())));
    (cell, entry)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .compact()
        .init();

    let socket = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/led_display.sock".to_string());

    let (_mode, mode_entry) = string_cell("snakes");
    let (_map, map_entry) = string_cell("map1");
    let (_image, image_entry) = string_cell("some_image.png");

    let agent = Arc::new(
        Agent::<UnixTransport>::builder()
            .handler(
                "image_dir",
                HandlerEntry::new().on_get(|_arg: Option<&Value>| Ok(json!("/tmp/images"))),
            )
            .handler(
                "images",
                HandlerEntry::new()
                    .on_get(|_arg: Option<&Value>| Ok(json!(["cat.png", "dog.png"]))),
            )
            .handler("image", image_entry)
            .handler(
                "display_modes",
                HandlerEntry::new().on_get(|_arg: Option<&Value>| Ok(json!(["images", "snakes"]))),
            )
            .handler("display_mode", mode_entry)
            .handler(
                "nr_snakes",
                HandlerEntry::new()
                    .on_set(|v: Value| async move {
                        info!("setting nr_snakes: {}", v);
                        Ok(())
                    })
                    .on_get(|_arg: Option<&Value>| Ok(json!(20))),
            )
            .handler(
                "snake_maps",
                HandlerEntry::new().on_get(|_arg: Option<&Value>| Ok(json!(["map1", "map2"]))),
            )
            .handler("snake_map", map_entry)
            .build(UnixTransport::new(&socket)),
    );

    info!("dummy driver connecting to {}", socket);
    agent.run().await;
}
