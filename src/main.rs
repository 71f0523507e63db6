mod backup;
mod db;
mod ipc;
mod schedule;

use std::io::{self, BufRead, Write};

fn serve(input: impl BufRead, mut output: impl Write) {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    for line in input.lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; emit a bare error line.
                let _ = writeln!(
                    output,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
                let _ = output.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            output,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = output.flush();
    }
}

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout);
}
