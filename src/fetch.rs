//! Feed download.
//!
//! One job: copy a remote resource byte-for-byte into a local file. The
//! body is streamed into a `.part` staging file that is renamed into place
//! only after the copy completes, so a crashed or failed download never
//! leaves a half-written destination behind.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("could not write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Seam between the pipeline and the network, so cycles can run against
/// canned bytes in tests.
pub trait Fetch {
    fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError>;
}

/// HTTP(S) fetcher backed by a reusable agent with a bounded timeout.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("stockfeed/", env!("CARGO_PKG_VERSION")))
            .build();

        HttpFetcher { agent }
    }
}

impl Fetch for HttpFetcher {
    fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let response = self.agent.get(url).call().map_err(|e| FetchError::Request {
            url: url.to_string(),
            source: Box::new(e),
        })?;

        let staging = staging_path(dest);

        match write_body(response, &staging) {
            Ok(()) => fs::rename(&staging, dest).map_err(|e| FetchError::Io {
                path: dest.to_path_buf(),
                source: e,
            }),
            Err(e) => {
                // leave no partial file behind
                let _ = fs::remove_file(&staging);
                Err(FetchError::Io {
                    path: staging,
                    source: e,
                })
            }
        }
    }
}

fn write_body(response: ureq::Response, staging: &Path) -> io::Result<()> {
    let mut file = File::create(staging)?;
    io::copy(&mut response.into_reader(), &mut file)?;
    Ok(())
}

/// `<dest>.part`, alongside the destination so the final rename stays on
/// one filesystem.
fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
