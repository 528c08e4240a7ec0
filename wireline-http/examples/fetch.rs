use std::time::Duration;

use wireline_http::Client;

fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_string());

    let client = Client::new(Client::options()).expect("failed to start client");

    let result = client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .wait();

    match result {
        Ok(response) => {
            eprintln!("{} {} bytes", response.status(), response.body().len());
            print!("{}", String::from_utf8_lossy(response.body()));
        }
        Err(err) => eprintln!("request failed: {err}"),
    }

    client.shutdown();
}
