// examples/client.rs
//
// Blocking demo client for the service example.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use ravel::{encode_frame, encode_request};

fn send_request(stream: &mut UnixStream, command: &str, args: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(&encode_frame(&encode_request(command, args)))?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let length = u32::from_le_bytes(header) as usize;

    let mut response = vec![0u8; length];
    stream.read_exact(&mut response)?;
    Ok(response)
}

fn main() -> std::io::Result<()> {
    let mut stream = UnixStream::connect("/tmp/ravel.sock")?;
    println!("connected to /tmp/ravel.sock");

    let response = send_request(&mut stream, "ping", b"")?;
    println!("ping  -> {}", String::from_utf8_lossy(&response));

    let response = send_request(&mut stream, "echo", b"Hello World")?;
    println!("echo  -> {}", String::from_utf8_lossy(&response));

    let mut args = vec![b'+'];
    args.extend_from_slice(&15.7f64.to_le_bytes());
    args.extend_from_slice(&3.2f64.to_le_bytes());
    let response = send_request(&mut stream, "math", &args)?;
    if response.len() == 8 {
        let result = f64::from_le_bytes(response[..8].try_into().unwrap());
        println!("math  -> {result}");
    } else {
        println!("math  -> {}", String::from_utf8_lossy(&response));
    }

    let response = send_request(&mut stream, "stats", &[10, 20, 30, 40, 50])?;
    println!("stats -> {}", String::from_utf8_lossy(&response));

    let response = send_request(&mut stream, "info", b"")?;
    println!("info  ->\n{}", String::from_utf8_lossy(&response));

    Ok(())
}
