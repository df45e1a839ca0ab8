//! Minimal end-to-end run: three clients connect, one of them sends two
//! messages (one short-form, one long-form frame), the server pops them from
//! its delivery queue and broadcasts them to everyone, then shuts down.

use config::Config;
use framecomm::{Client, Server};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const NUM_CLIENTS: usize = 3;

fn main() {
    let config = Config::default();

    // Start the server with its accept loop on a separate thread
    let mut server = Server::new(&config).expect("Failed to create server");
    let server_addr = server.bind("127.0.0.1:0").expect("Failed to bind");
    server.listen().expect("Failed to listen");
    let server = Arc::new(server);
    println!("[Server] Listening on {server_addr}");

    let accept_server = Arc::clone(&server);
    let accept_handle = thread::spawn(move || accept_server.run());

    // Connect the clients
    let mut clients: Vec<Client> = (0..NUM_CLIENTS)
        .map(|_| Client::connect(server_addr, &config).expect("Failed to connect"))
        .collect();

    // Registration happens on the accept thread, so wait for it
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.registry().len() < NUM_CLIENTS {
        assert!(Instant::now() < deadline, "Clients were not registered in time");
        thread::sleep(Duration::from_millis(10));
    }
    println!("[Server] {} clients registered", server.registry().len());

    let short = b"hello, everyone".to_vec();
    let long = vec![b'x'; 300];
    clients[0].send(&short).expect("Failed to send");
    clients[0].send(&long).expect("Failed to send");

    // Consume both messages and fan them out
    for _ in 0..2 {
        let msg = server
            .pop_timeout(Duration::from_secs(5))
            .expect("No message arrived");
        println!("[Server] Broadcasting {} bytes", msg.len());
        let failures = server.broadcast(&msg).expect("Failed to frame message");
        assert!(failures.is_empty(), "Broadcast failures: {failures:?}");
    }

    for (i, client) in clients.iter_mut().enumerate() {
        let first = client.recv().expect("Failed to receive");
        let second = client.recv().expect("Failed to receive");
        assert_eq!(first.as_deref(), Some(&short[..]));
        assert_eq!(second.as_deref(), Some(&long[..]));
        println!("[Client {i}] Received both messages");
    }

    server.shutdown().expect("Failed to shut down server");
    accept_handle.join().expect("Accept thread panicked");

    for client in &mut clients {
        assert!(client.recv().expect("Failed to receive").is_none());
    }
    println!("[Server] Shut down cleanly");
}
