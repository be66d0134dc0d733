//! API reachability check before hosted provisioning

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use twinrun_common::{Error, Result};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Wait until `url` answers any HTTP response
pub async fn wait_for_api(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;

    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match client.get(url).send().await {
            Ok(resp) => {
                info!("API at {} answered {}", url, resp.status());
                return Ok(());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for API at {}...", url);
                }
                // Refused connections are expected while the API starts
                if !e.is_connect() && !e.is_timeout() {
                    warn!("API check error: {}", e);
                }
            }
        }

        if start.elapsed() + RETRY_DELAY >= timeout {
            break;
        }
        sleep(RETRY_DELAY).await;
    }

    Err(Error::Unreachable {
        url: url.to_string(),
        attempts,
    })
}
