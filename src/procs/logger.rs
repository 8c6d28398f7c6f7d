// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

/// Recv captured stdout and stderr of a child and channel every line to the log.
///
/// Rules:
///  - one task per stream, each ends at EOF, i.e. when the child and its group are gone
///  - lines are tagged with the app, phase (`clone` or a step name) and stream they came from
pub fn forward_output(app: &str, phase: &'static str, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(app.to_string(), phase, "stdout", stdout));
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(app.to_string(), phase, "stderr", stderr));
    }
}

async fn forward_lines<R>(app: String, phase: &'static str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "readyset::child", app = %app, phase, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(app = %app, phase, stream, "error reading output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_lines_ends_at_eof() {
        let input: &[u8] = b"first\nsecond\n";
        forward_lines("app".to_string(), "build", "stdout", input).await;
    }
}
