// examples/service.rs
//
// Demo command server on /tmp/ravel.sock. Poke it with the client example
// or with signals:
//
//   cargo run --example service
//   cargo run --example client
//   kill -USR1 <pid>   # print statistics
//   kill -INT <pid>    # graceful shutdown

use ravel::{init_logging, ServiceManager};

fn ping_handler(_args: &[u8], response: &mut Vec<u8>) {
    response.extend_from_slice(b"pong");
}

fn echo_handler(args: &[u8], response: &mut Vec<u8>) {
    response.extend_from_slice(args);
}

// One operation byte, then two little-endian f64 operands.
fn math_handler(args: &[u8], response: &mut Vec<u8>) {
    if args.len() < 1 + 2 * std::mem::size_of::<f64>() {
        response.extend_from_slice(b"ERROR: Invalid math request format");
        return;
    }

    let op = args[0];
    let a = f64::from_le_bytes(args[1..9].try_into().unwrap());
    let b = f64::from_le_bytes(args[9..17].try_into().unwrap());

    let result = match op {
        b'+' => a + b,
        b'-' => a - b,
        b'*' => a * b,
        b'/' => {
            if b != 0.0 {
                a / b
            } else {
                0.0
            }
        }
        _ => {
            response.extend_from_slice(b"ERROR: Unknown operation");
            return;
        }
    };

    response.extend_from_slice(&result.to_le_bytes());
}

fn stats_handler(args: &[u8], response: &mut Vec<u8>) {
    if args.is_empty() {
        response.extend_from_slice(b"ERROR: No data provided");
        return;
    }

    let sum: f64 = args.iter().map(|&b| b as f64).sum();
    let mean = sum / args.len() as f64;
    let min = args.iter().min().unwrap();
    let max = args.iter().max().unwrap();

    let text = format!("Sum: {sum}, Mean: {mean}, Min: {min}, Max: {max}");
    response.extend_from_slice(text.as_bytes());
}

fn info_handler(_args: &[u8], response: &mut Vec<u8>) {
    response.extend_from_slice(
        b"ravel service demo\n\
          Protocol: binary\n\
          Supported commands: ping, echo, math, stats, info",
    );
}

fn main() {
    init_logging();

    let manager = ServiceManager::new("/tmp/ravel.sock");
    manager.register_handler("ping", ping_handler);
    manager.register_handler("echo", echo_handler);
    manager.register_handler("math", math_handler);
    manager.register_handler("stats", stats_handler);
    manager.register_handler("info", info_handler);

    if let Err(e) = manager.start() {
        eprintln!("failed to start: {e}");
        std::process::exit(1);
    }

    println!("listening on /tmp/ravel.sock (pid {})", std::process::id());
    manager.run();
}
