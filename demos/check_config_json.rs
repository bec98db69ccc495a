//! Manual exercise harness for an overlay configuration document.
//!
//! Grounded in `original_source/example/check_config_json.cpp`: load a
//! config file, stand up a `Channel` for the given node id, send the raw
//! config bytes (length-prefixed) to every connected peer, then read the
//! same back from each of them. Not part of the crate's API contract —
//! run with `cargo run --bin check_config_json -- <path> <node-id>`.

use std::env;
use std::fs;
use std::process;
use std::time::Duration;

use conduit::Channel;

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <config-file> <node-id>", args[0]);
        process::exit(1);
    }
    let file_name = &args[1];
    let node_id = &args[2];

    let config_str = fs::read_to_string(file_name).unwrap_or_else(|e| {
        eprintln!("open file {} error: {}", file_name, e);
        process::exit(1);
    });
    println!("config:{}", config_str);

    let channel = Channel::create("check-config-json", node_id, &config_str, None).unwrap_or_else(|e| {
        eprintln!("failed to create channel: {:?}", e);
        process::exit(1);
    });

    let connected_nodes = channel.get_connected_node_ids();
    let data_id = "c0ffee";
    let config_bytes = config_str.as_bytes();
    let config_len = (config_bytes.len() as u32).to_le_bytes();

    for peer in &connected_nodes {
        channel.send(peer, data_id, &config_len).unwrap();
        channel.send(peer, data_id, config_bytes).unwrap();
        println!("send data to {}", peer);
    }

    for peer in &connected_nodes {
        let mut len_buf = [0u8; 4];
        channel
            .recv(peer, data_id, &mut len_buf, 4, Some(Duration::from_secs(30)))
            .unwrap();
        let data_size = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; data_size];
        channel
            .recv(peer, data_id, &mut data, data_size, Some(Duration::from_secs(30)))
            .unwrap();
        println!("recv data from {}, size:{}", peer, data_size);
    }

    Channel::destroy(channel);
}
