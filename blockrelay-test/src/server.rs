//! Exposes an in-process relay server for use in integration tests.
//!
//! ```
//! use blockrelay_test::server::{TestObject, TestServer};
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::with_objects(vec![
//!        TestObject::new("intro", 1, 42, vec![0u8; 1024]).named("intro.mp4"),
//!    ])
//!    .await;
//!    let url = server.url("/dl/intro/intro.mp4");
//!    // use the URL in tests...
//! }
//! ```

use std::net::{SocketAddr, TcpListener};

use blockrelay_server::config::{Config, ConfigSecret, Upstream};
use blockrelay_server::state::Services;
use blockrelay_server::web::App;
use blockrelay_service::registry::ObjectRecord;
use blockrelay_service::source::LocalFs;
use blockrelay_service::{Locator, ShardId};
use bytes::Bytes;
use secrecy::SecretBox;
use tempfile::TempDir;

/// The shard on which test workers are provisioned.
pub const HOME_SHARD: ShardId = ShardId(1);

/// Credentials of the workers started by [`TestServer::with_objects`].
pub const WORKERS: &[&str] = &["worker-a", "worker-b"];

/// An object stored in the test server's upstream.
#[derive(Clone, Debug)]
pub struct TestObject {
    /// Public reference used in download URLs.
    pub object_ref: String,
    /// Shard storing the object.
    pub shard: ShardId,
    /// Shard-local id of the object.
    pub object_id: u64,
    /// Full contents of the object.
    pub contents: Bytes,
    /// Display name registered for the object.
    pub name: Option<String>,
    /// Media type registered for the object.
    pub media_type: Option<String>,
}

impl TestObject {
    /// Creates an object without a registered name or media type.
    pub fn new(object_ref: &str, shard: u32, object_id: u64, contents: impl Into<Bytes>) -> Self {
        Self {
            object_ref: object_ref.to_owned(),
            shard: ShardId(shard),
            object_id,
            contents: contents.into(),
            name: None,
            media_type: None,
        }
    }

    /// Registers a display name for the object.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Registers a media type for the object.
    pub fn with_media_type(mut self, media_type: &str) -> Self {
        self.media_type = Some(media_type.to_owned());
        self
    }

    fn locator(&self) -> Locator {
        Locator {
            shard: self.shard,
            object_id: self.object_id,
            access_hash: self.object_id.wrapping_mul(0x9e37_79b9),
            reference: Bytes::from_static(b"test-reference"),
        }
    }
}

/// Returns `len` bytes of a repeating, position-dependent pattern.
///
/// Every byte differs from its neighbours, so misaligned slices of the pattern are detected.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// An in-process relay server for use in integration tests.
///
/// The upstream is a filesystem store in a temporary directory, which is deleted when the server
/// is dropped. The server listens on a random available port on localhost.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    _tempdir: TempDir,
}

impl TestServer {
    /// Starts a server with two workers and no objects.
    pub async fn new() -> Self {
        Self::with_objects(Vec::new()).await
    }

    /// Starts a server with two workers serving the given objects.
    pub async fn with_objects(objects: Vec<TestObject>) -> Self {
        let config = Config {
            workers: WORKERS
                .iter()
                .map(|credential| SecretBox::new(Box::new(ConfigSecret::from(*credential))))
                .collect(),
            ..Default::default()
        };

        Self::with_config(config, objects).await
    }

    /// Starts a server with a custom configuration serving the given objects.
    ///
    /// The upstream is always replaced with a filesystem store on [`HOME_SHARD`] holding the
    /// objects. Workers are taken from `config` as given.
    pub async fn with_config(mut config: Config, objects: Vec<TestObject>) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let tempdir = tempfile::tempdir().unwrap();
        for object in &objects {
            let path = LocalFs::object_path(tempdir.path(), object.shard, object.object_id);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, &object.contents).unwrap();

            let record = ObjectRecord {
                file_id: object.locator().encode().unwrap(),
                size: object.contents.len() as u64,
                name: object.name.clone(),
                media_type: object.media_type.clone(),
            };
            config
                .registry
                .objects
                .insert(object.object_ref.clone(), record);
        }

        config.http_addr = socket;
        config.upstream = Upstream::FileSystem {
            path: tempdir.path().into(),
            home_shard: HOME_SHARD,
        };

        let state = Services::spawn(config).await.unwrap();
        let app = App::new(state);

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            app.serve(listener).await.unwrap();
        });

        Self {
            handle,
            socket,
            _tempdir: tempdir,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
