//! Scenario-level tests driving `tsio`'s own listener with a plain
//! `std::net::TcpStream` client, mirroring mio's `tests/tcp.rs` layout.

#![cfg(feature = "net")]

use std::io::Write;
use std::net::TcpStream;

use tsio::io::{IoBuffer, Status, TsIo};
use tsio::sockaddr::Protocol;
use tsio::{Server, ServerConfig};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn free_port() -> u16 {
    40000 + (rand::random::<u16>() % 10000)
}

/// S2 — abort detection: client connects, sends 0 bytes then closes; the
/// worker dequeues with status=Aborted, bytes=0.
#[test]
fn abort_detection() {
    init();
    let server = Server::new(ServerConfig::default()).unwrap();
    let port = free_port();
    server.add_listening_socket(Protocol::TcpV4, port).unwrap();

    let client = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        drop(stream);
    });

    let listener = server.listen_for_connections().unwrap();
    let mut buf = [0u8; 64];
    let mut conn = TsIo::new(Protocol::TcpV4);
    conn.set_buffer(IoBuffer::Bytes {
        ptr: buf.as_mut_ptr(),
        len: buf.len(),
    });
    server.accept_conn(&listener, &mut conn).unwrap();

    let conn = server.wait_on_io_queue();
    assert_eq!(conn.status(), Status::Aborted);
    assert_eq!(conn.bytes_transferred(), 0);

    client.join().unwrap();
}

/// Same scenario, but the peer sends one byte before the graceful
/// disconnect-driven shutdown path runs its course on our side.
#[test]
fn accept_then_explicit_terminate() {
    init();
    let server = Server::new(ServerConfig::default()).unwrap();
    let port = free_port();
    server.add_listening_socket(Protocol::TcpV4, port).unwrap();

    let client = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
    });

    let listener = server.listen_for_connections().unwrap();
    let mut buf = [0u8; 64];
    let mut conn = TsIo::new(Protocol::TcpV4);
    conn.set_buffer(IoBuffer::Bytes {
        ptr: buf.as_mut_ptr(),
        len: buf.len(),
    });
    server.accept_conn(&listener, &mut conn).unwrap();

    let conn = server.wait_on_io_queue();
    assert_eq!(conn.status(), Status::Connected);
    assert_eq!(conn.bytes_transferred(), 1);

    server.terminate_conn(conn);
    client.join().unwrap();
}
