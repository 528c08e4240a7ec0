//! Integration tests: the full client stack against real TCP servers.
//!
//! Each test spawns a mock server on an ephemeral port, drives the client
//! through its public API, and verifies wire bytes or terminal outcomes.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wireline_http::{Client, Error};

// ── Mock server helpers ─────────────────────────────────────────────

/// Spawn a server; the handler runs once per accepted connection with the
/// zero-based connection index.
fn spawn_server<F>(handler: F) -> u16
where
    F: Fn(usize, TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else { break };
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler(index, stream));
        }
    });
    port
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one full request (headers plus Content-Length body). Returns None
/// on EOF or error.
fn read_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(header_end) = find_subsequence(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            let total = header_end + 4 + content_length;
            while buf.len() < total {
                match stream.read(&mut tmp) {
                    Ok(0) => return None,
                    Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    Err(_) => return None,
                }
            }
            return Some(buf);
        }
        match stream.read(&mut tmp) {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(_) => return None,
        }
    }
}

fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len())
        .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Serve requests on one connection until the peer goes away.
fn echo_ok_forever(mut stream: TcpStream, body: &[u8]) {
    while read_request(&mut stream).is_some() {
        if stream.write_all(&ok_response(body)).is_err() {
            break;
        }
    }
}

fn request_path(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let line = text.lines().next().unwrap_or("");
    line.split(' ').nth(1).unwrap_or("").to_string()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn get_resolves_with_status_and_body() {
    let port = spawn_server(|_, stream| echo_ok_forever(stream, b"OK"));
    let host = format!("127.0.0.1:{port}");

    let client = Client::new(Client::options()).unwrap();
    let response = client
        .get(&format!("http://{host}/"))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("request failed");

    assert_eq!(response.status(), 200);
    assert_eq!(&response.body()[..], b"OK");

    // The completion hook returns the lease after the future resolves.
    assert!(
        wait_until(Duration::from_secs(2), || client.used_connections(&host) == 0),
        "lease never returned to idle"
    );
    client.shutdown();
}

#[test]
fn post_wire_format_is_deterministic() {
    let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = Arc::clone(&captured);
    let port = spawn_server(move |_, mut stream| {
        if let Some(raw) = read_request(&mut stream) {
            *capture.lock().unwrap() = raw;
            let _ = stream.write_all(&ok_response(b""));
        }
    });
    let host = format!("127.0.0.1:{port}");

    let client = Client::new(Client::options()).unwrap();
    let response = client
        .post(&format!("http://{host}/x"))
        .header("X-Y", "1")
        .body("abc")
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("request failed");
    assert_eq!(response.status(), 200);

    let wire = captured.lock().unwrap().clone();
    let wire_text = String::from_utf8(wire).unwrap();
    assert!(wire_text.starts_with("POST /x HTTP/1.1\r\n"), "{wire_text}");
    assert!(wire_text.contains("X-Y: 1\r\n"));
    assert!(wire_text.contains("User-Agent: wireline/0.1\r\n"));
    assert!(wire_text.contains(&format!("Host: {host}\r\n")));
    assert!(wire_text.ends_with("Content-Length: 3\r\n\r\nabc"));

    client.shutdown();
}

#[test]
fn caller_supplied_user_agent_is_stripped() {
    let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = Arc::clone(&captured);
    let port = spawn_server(move |_, mut stream| {
        if let Some(raw) = read_request(&mut stream) {
            *capture.lock().unwrap() = raw;
            let _ = stream.write_all(&ok_response(b""));
        }
    });

    let client = Client::new(Client::options()).unwrap();
    client
        .get(&format!("http://127.0.0.1:{port}/"))
        .header("User-Agent", "custom/9.9")
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("request failed");

    let wire_text = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
    assert!(!wire_text.contains("custom/9.9"));
    assert_eq!(wire_text.matches("User-Agent:").count(), 1);
    assert!(wire_text.contains("User-Agent: wireline/0.1\r\n"));

    client.shutdown();
}

#[test]
fn timeout_rejects_then_fresh_slot_succeeds() {
    // First connection never gets a response; later connections do.
    let port = spawn_server(|index, mut stream| {
        if index == 0 {
            // Hold the socket open, never respond.
            let _ = read_request(&mut stream);
            thread::sleep(Duration::from_secs(10));
        } else {
            echo_ok_forever(stream, b"OK");
        }
    });
    let url = format!("http://127.0.0.1:{port}/");

    let client = Client::new(Client::options()).unwrap();

    let started = Instant::now();
    let result = client
        .get(&url)
        .timeout(Duration::from_millis(50))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("timeout never fired");
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "timer fired far too late: {:?}",
        started.elapsed()
    );

    // The timed-out connection was closed; the next request reconnects.
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("second request failed");
    assert_eq!(response.status(), 200);

    client.shutdown();
}

#[test]
fn remote_close_rejects_with_recv_failure() {
    let port = spawn_server(|_, stream| {
        // Accept, then close without reading or responding.
        drop(stream);
    });
    let host = format!("127.0.0.1:{port}");

    let client = Client::new(Client::options()).unwrap();
    let result = client
        .get(&format!("http://{host}/"))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung");
    assert!(matches!(result, Err(Error::Recv(_))), "{result:?}");

    assert!(
        wait_until(Duration::from_secs(2), || client.used_connections(&host) == 0),
        "lease never returned after failure"
    );
    client.shutdown();
}

#[test]
fn pool_of_one_serializes_two_concurrent_gets() {
    let served = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&served);
    let port = spawn_server(move |_, mut stream| {
        while read_request(&mut stream).is_some() {
            count.fetch_add(1, Ordering::SeqCst);
            if stream.write_all(&ok_response(b"hi")).is_err() {
                break;
            }
        }
    });
    let url = format!("http://127.0.0.1:{port}/");

    let client = Client::new(Client::options().max_connections_per_host(1)).unwrap();
    let first = client.get(&url).send();
    let second = client.get(&url).send();

    let first = first
        .wait_timeout(Duration::from_secs(5))
        .expect("first hung")
        .expect("first failed");
    let second = second
        .wait_timeout(Duration::from_secs(5))
        .expect("second hung")
        .expect("second failed");
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);
    assert_eq!(served.load(Ordering::SeqCst), 2);

    client.shutdown();
}

#[test]
fn admission_queue_rejects_beyond_capacity_and_drains_fifo() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let port = spawn_server(move |_, mut stream| {
        while let Some(raw) = read_request(&mut stream) {
            let path = request_path(&raw);
            if path == "/slow" {
                thread::sleep(Duration::from_millis(500));
            }
            seen.lock().unwrap().push(path);
            if stream.write_all(&ok_response(b"")).is_err() {
                break;
            }
        }
    });
    let base = format!("http://127.0.0.1:{port}");

    let client = Client::new(
        Client::options()
            .max_connections_per_host(1)
            .max_pending_per_host(2),
    )
    .unwrap();

    // Occupy the single slot...
    let slow = client.get(&format!("{base}/slow")).send();
    thread::sleep(Duration::from_millis(50));

    // ...then two requests defer and a third rejects synchronously.
    let b = client.get(&format!("{base}/b")).send();
    let c = client.get(&format!("{base}/c")).send();
    let d = client.get(&format!("{base}/d")).send();

    let rejected = d
        .wait_timeout(Duration::from_secs(1))
        .expect("overflow request did not settle");
    assert!(matches!(rejected, Err(Error::QueueFull)), "{rejected:?}");

    assert!(slow
        .wait_timeout(Duration::from_secs(5))
        .expect("slow hung")
        .is_ok());
    assert!(b
        .wait_timeout(Duration::from_secs(5))
        .expect("b hung")
        .is_ok());
    assert!(c
        .wait_timeout(Duration::from_secs(5))
        .expect("c hung")
        .is_ok());

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["/slow", "/b", "/c"], "deferred order broke");

    client.shutdown();
}

#[test]
fn response_larger_than_recv_buffer() {
    // Well past the 64 KiB per-read buffer.
    let body: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    let payload = body.clone();
    let port = spawn_server(move |_, mut stream| {
        if read_request(&mut stream).is_some() {
            let _ = stream.write_all(&ok_response(&payload));
        }
    });

    let client = Client::new(Client::options()).unwrap();
    let response = client
        .get(&format!("http://127.0.0.1:{port}/big"))
        .send()
        .wait_timeout(Duration::from_secs(10))
        .expect("request hung")
        .expect("request failed");
    assert_eq!(response.body().len(), body.len());
    assert_eq!(&response.body()[..], &body[..]);

    client.shutdown();
}

#[test]
fn chunked_response_is_reassembled() {
    let port = spawn_server(|_, mut stream| {
        if read_request(&mut stream).is_some() {
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            );
        }
    });

    let client = Client::new(Client::options()).unwrap();
    let response = client
        .get(&format!("http://127.0.0.1:{port}/"))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("request failed");
    assert_eq!(&response.body()[..], b"hello world");

    client.shutdown();
}

#[test]
fn keep_alive_off_sends_connection_close_and_tears_down() {
    let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let saw_eof = Arc::new(AtomicUsize::new(0));
    let capture = Arc::clone(&captured);
    let eof = Arc::clone(&saw_eof);
    let port = spawn_server(move |_, mut stream| {
        if let Some(raw) = read_request(&mut stream) {
            *capture.lock().unwrap() = raw;
            let _ = stream.write_all(&ok_response(b"bye"));
            // The client should close its side after the exchange.
            let mut tmp = [0u8; 1];
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            if let Ok(0) = stream.read(&mut tmp) {
                eof.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    let host = format!("127.0.0.1:{port}");

    let client = Client::new(Client::options().keep_alive(false)).unwrap();
    let response = client
        .get(&format!("http://{host}/"))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung")
        .expect("request failed");
    assert_eq!(&response.body()[..], b"bye");

    let wire_text = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
    assert!(wire_text.contains("Connection: close\r\n"));

    assert!(
        wait_until(Duration::from_secs(3), || saw_eof.load(Ordering::SeqCst) == 1),
        "client never closed the exchange"
    );
    client.shutdown();
}

#[test]
fn connect_refused_rejects_with_connect_failure() {
    // Bind then drop so nothing listens on the port.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::new(Client::options()).unwrap();
    let result = client
        .get(&format!("http://127.0.0.1:{port}/"))
        .send()
        .wait_timeout(Duration::from_secs(5))
        .expect("request hung");
    assert!(matches!(result, Err(Error::Connect(_))), "{result:?}");

    client.shutdown();
}

#[test]
fn sequential_requests_reuse_the_connection() {
    let conns = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&conns);
    let port = spawn_server(move |_, stream| {
        count.fetch_add(1, Ordering::SeqCst);
        echo_ok_forever(stream, b"again");
    });
    let url = format!("http://127.0.0.1:{port}/");

    let client = Client::new(Client::options()).unwrap();
    for _ in 0..5 {
        let response = client
            .get(&url)
            .send()
            .wait_timeout(Duration::from_secs(5))
            .expect("request hung")
            .expect("request failed");
        assert_eq!(response.status(), 200);
    }
    assert_eq!(conns.load(Ordering::SeqCst), 1, "connection was not reused");

    client.shutdown();
}

#[test]
fn independent_hosts_do_not_share_slots() {
    let port_a = spawn_server(|_, stream| echo_ok_forever(stream, b"a"));
    let port_b = spawn_server(|_, stream| echo_ok_forever(stream, b"b"));

    let client = Client::new(Client::options().max_connections_per_host(1)).unwrap();
    let a = client.get(&format!("http://127.0.0.1:{port_a}/")).send();
    let b = client.get(&format!("http://127.0.0.1:{port_b}/")).send();

    let a = a
        .wait_timeout(Duration::from_secs(5))
        .expect("a hung")
        .expect("a failed");
    let b = b
        .wait_timeout(Duration::from_secs(5))
        .expect("b hung")
        .expect("b failed");
    assert_eq!(&a.body()[..], b"a");
    assert_eq!(&b.body()[..], b"b");

    client.shutdown();
}

#[test]
fn many_concurrent_callers_all_complete() {
    let port = spawn_server(|_, stream| echo_ok_forever(stream, b"pong"));
    let url = format!("http://127.0.0.1:{port}/");

    let client = Arc::new(
        Client::new(
            Client::options()
                .threads(2)
                .max_connections_per_host(4),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        let url = url.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..5 {
                let response = client
                    .get(&url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .wait_timeout(Duration::from_secs(10))
                    .expect("request hung")
                    .expect("request failed");
                assert_eq!(response.status(), 200);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    client.shutdown();
}
