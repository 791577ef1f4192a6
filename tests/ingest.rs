use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat};
use plist::{Dictionary, Value};
use serde_json::{Map, json};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use ipa_server::io::{Channel, Command, CommandKind, MAX_READ_LEN};
use ipa_server::{
    Error, Ingestor, InstallManifest, JsonLinesChannel, LocalStorage, PackageKind, RemoteFile,
    SpoolMode,
};

fn demo_ipa() -> Vec<u8> {
    demo_ipa_with(&[("Payload/Demo.app/AppIcon60x60@2x.png", png(120))])
}

fn png(size: u32) -> Vec<u8> {
    let mut icon = Vec::new();
    DynamicImage::new_rgba8(size, size)
        .write_to(&mut Cursor::new(&mut icon), ImageFormat::Png)
        .unwrap();
    icon
}

/// The demo app's Info.plist and binary plus `extra` entries, all stored.
fn demo_ipa_with(extra: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut dict = Dictionary::new();
    for (key, value) in [
        ("CFBundleDisplayName", "Demo"),
        ("CFBundleIdentifier", "com.example.demo"),
        ("CFBundleShortVersionString", "1.2.0"),
        ("CFBundleVersion", "42"),
        ("CFBundleIconFiles", "AppIcon60x60"),
    ] {
        dict.insert(key.to_string(), Value::String(value.to_string()));
    }
    let mut info = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut info).unwrap();

    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("Payload/Demo.app/Info.plist", stored).unwrap();
    writer.write_all(&info).unwrap();
    for (name, data) in extra {
        writer.start_file(*name, stored).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.start_file("Payload/Demo.app/Demo", stored).unwrap();
    writer.write_all(&[0xcf; 4096]).unwrap();
    writer.finish().unwrap().into_inner()
}

fn store() -> (TempDir, Ingestor<LocalStorage>) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    (dir, Ingestor::new(storage, InstallManifest::default()))
}

fn stored_files(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

#[tokio::test]
async fn test_upload_is_stored_with_icon() {
    for mode in [SpoolMode::Memory, SpoolMode::Disk] {
        let (dir, ingestor) = store();
        let data = demo_ipa();
        let size = data.len() as u64;

        let app = ingestor
            .ingest_upload(Cursor::new(data.clone()), size, Some("Demo.IPA"), mode)
            .await
            .unwrap();

        assert_eq!(app.name, "Demo");
        assert_eq!(app.version, "1.2.0");
        assert_eq!(app.build, "42");
        assert_eq!(app.identifier, "com.example.demo");
        assert_eq!(app.kind, PackageKind::Ipa);
        assert_eq!(app.size, size);
        assert!(!app.none_icon);

        let stored = dir.path().join(app.package_storage_name());
        assert_eq!(std::fs::read(stored).unwrap(), data);

        let icon = dir.path().join(app.icon_storage_name().unwrap());
        let icon = image::load_from_memory(&std::fs::read(icon).unwrap()).unwrap();
        assert_eq!((icon.width(), icon.height()), (120, 120));

        // no public URL, no install manifest
        assert!(!dir.path().join(app.manifest_storage_name()).exists());
    }
}

#[tokio::test]
async fn test_kind_is_sniffed_without_a_name() {
    let (_dir, ingestor) = store();
    let data = demo_ipa();
    let size = data.len() as u64;

    let app = ingestor
        .ingest_upload(Cursor::new(data), size, None, SpoolMode::Memory)
        .await
        .unwrap();
    assert_eq!(app.kind, PackageKind::Ipa);
}

#[tokio::test]
async fn test_install_manifest_points_at_stored_objects() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let ingestor = Ingestor::new(storage, InstallManifest::default())
        .with_public_url("https://dl.example.com/files/");

    let data = demo_ipa();
    let size = data.len() as u64;
    let app = ingestor
        .ingest_upload(Cursor::new(data), size, Some("demo.ipa"), SpoolMode::Memory)
        .await
        .unwrap();

    let manifest = std::fs::read(dir.path().join(app.manifest_storage_name())).unwrap();
    let manifest = Value::from_reader(Cursor::new(manifest)).unwrap();
    let item = &manifest.as_dictionary().unwrap()["items"].as_array().unwrap()[0];
    let item = item.as_dictionary().unwrap();

    let assets = item["assets"].as_array().unwrap();
    let urls: Vec<&str> = assets
        .iter()
        .map(|a| a.as_dictionary().unwrap()["url"].as_string().unwrap())
        .collect();
    assert_eq!(
        urls[0],
        format!(
            "https://dl.example.com/files/com.example.demo/{}/ipa.ipa",
            app.id
        )
    );
    assert!(urls[1].ends_with(&format!("{}/icon.png", app.id)));

    let metadata = item["metadata"].as_dictionary().unwrap();
    assert_eq!(metadata["bundle-identifier"].as_string(), Some("com.example.demo"));
    assert_eq!(metadata["bundle-version"].as_string(), Some("1.2.0"));
    assert_eq!(metadata["title"].as_string(), Some("Demo"));
}

#[tokio::test]
async fn test_rejected_upload_leaves_storage_empty() {
    let (dir, ingestor) = store();

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("Payload/Demo.app/Demo", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"binary").unwrap();
    let data = writer.finish().unwrap().into_inner();
    let size = data.len() as u64;

    let result = ingestor
        .ingest_upload(Cursor::new(data), size, Some("demo.ipa"), SpoolMode::Disk)
        .await;
    assert!(matches!(result, Err(Error::ManifestNotFound)));
    assert!(stored_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_declared_size_beyond_stream_fails() {
    let (dir, ingestor) = store();
    let data = demo_ipa();
    let size = data.len() as u64 + 512;

    let result = ingestor
        .ingest_upload(Cursor::new(data), size, Some("demo.ipa"), SpoolMode::Memory)
        .await;
    assert!(result.is_err());
    assert!(stored_files(dir.path()).is_empty());
}

/// Plays the browser side of a bridge session: serves the file and returns
/// the metadata it receives with `Done`.
async fn browser(mut peer: JsonLinesChannel<tokio::io::DuplexStream>, data: Vec<u8>) -> Map<String, serde_json::Value> {
    loop {
        let request = peer.recv().await.unwrap();
        let param = match request.command {
            CommandKind::Size => json!({"size": data.len()}),
            CommandKind::Name => json!({"name": "Demo.ipa"}),
            CommandKind::ReadAt => {
                let offset = request.param["offset"].as_u64().unwrap() as usize;
                let length = request.param["length"].as_u64().unwrap() as usize;
                let start = offset.min(data.len());
                let end = (offset + length).min(data.len());
                json!({"data": STANDARD.encode(&data[start..end])})
            }
            CommandKind::Done => return request.param,
        };
        let serde_json::Value::Object(param) = param else {
            unreachable!()
        };
        peer.send(&Command::new(request.command, request.request_id, param))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_remote_upload_reports_metadata_to_peer() {
    let (dir, ingestor) = store();
    let (server_side, browser_side) = tokio::io::duplex(256 * 1024);
    let data = demo_ipa();
    let peer = tokio::spawn(browser(JsonLinesChannel::new(browser_side), data.clone()));

    let remote = Arc::new(RemoteFile::new(JsonLinesChannel::new(server_side)));
    let app = ingestor.ingest_remote(remote).await.unwrap();

    let reported = peer.await.unwrap();
    assert_eq!(reported["id"], json!(app.id));
    assert_eq!(reported["identifier"], json!("com.example.demo"));
    assert_eq!(reported["noneIcon"], json!(false));
    assert_eq!(reported["type"], json!(0));

    let stored = dir.path().join(app.package_storage_name());
    assert_eq!(std::fs::read(stored).unwrap(), data);
}

#[tokio::test]
async fn test_remote_peer_disconnect_fails_the_session() {
    let (dir, ingestor) = store();
    let (server_side, browser_side) = tokio::io::duplex(1024);
    drop(browser_side);

    let remote = Arc::new(RemoteFile::new(JsonLinesChannel::new(server_side)));
    let result = ingestor.ingest_remote(remote).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(stored_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_remote_entry_larger_than_one_frame() {
    let (dir, ingestor) = store();
    // the broken icon sends parsing on to the 50 MB catalog
    let data = demo_ipa_with(&[
        ("Payload/Demo.app/AppIcon60x60@2x.png", b"not a png".to_vec()),
        ("Payload/Demo.app/Assets.car", vec![0u8; 50 * 1024 * 1024]),
    ]);
    let (server_side, browser_side) = tokio::io::duplex(256 * 1024);
    let peer = tokio::spawn(browser(JsonLinesChannel::new(browser_side), data.clone()));

    let remote = Arc::new(RemoteFile::new(JsonLinesChannel::new(server_side)));
    let app = ingestor.ingest_remote(remote).await.unwrap();
    assert!(app.none_icon);

    let reported = peer.await.unwrap();
    assert_eq!(reported["noneIcon"], json!(true));
    let stored = std::fs::read(dir.path().join(app.package_storage_name())).unwrap();
    assert_eq!(stored.len(), data.len());
    assert!(stored == data);
}

/// A peer served in-process: replies are queued on `send` and handed out
/// by `recv`. It hangs up once `hang_up` says so.
struct ScriptedPeer {
    data: Vec<u8>,
    replies: VecDeque<Command>,
    full_reads: usize,
    hang_up: fn(&Command, usize) -> bool,
}

impl ScriptedPeer {
    fn new(data: Vec<u8>, hang_up: fn(&Command, usize) -> bool) -> Self {
        Self {
            data,
            replies: VecDeque::new(),
            full_reads: 0,
            hang_up,
        }
    }
}

#[async_trait]
impl Channel for ScriptedPeer {
    async fn send(&mut self, command: &Command) -> ipa_server::Result<()> {
        if command.command == CommandKind::ReadAt
            && command.param["length"].as_u64() == Some(MAX_READ_LEN as u64)
        {
            self.full_reads += 1;
        }
        if (self.hang_up)(command, self.full_reads) {
            return Err(Error::Transport("peer hung up".to_string()));
        }

        let param = match command.command {
            CommandKind::Size => json!({"size": self.data.len()}),
            CommandKind::Name => json!({"name": "Demo.ipa"}),
            CommandKind::ReadAt => {
                let offset = command.param["offset"].as_u64().unwrap() as usize;
                let length = command.param["length"].as_u64().unwrap() as usize;
                let start = offset.min(self.data.len());
                let end = (offset + length).min(self.data.len());
                json!({"data": STANDARD.encode(&self.data[start..end])})
            }
            CommandKind::Done => return Ok(()),
        };
        let serde_json::Value::Object(param) = param else {
            unreachable!()
        };
        self.replies
            .push_back(Command::new(command.command, command.request_id.clone(), param));
        Ok(())
    }

    async fn recv(&mut self) -> ipa_server::Result<Command> {
        self.replies
            .pop_front()
            .ok_or_else(|| Error::Transport("channel closed".to_string()))
    }
}

#[tokio::test]
async fn test_peer_lost_while_saving_leaves_storage_empty() {
    let (dir, ingestor) = store();
    let data = demo_ipa_with(&[("Payload/Demo.app/Filler", vec![7u8; 5 * 1024 * 1024])]);

    // parsing only reads small ranges; the third full-size read is
    // the second half of the second 2 MiB copy chunk
    let peer = ScriptedPeer::new(data, |_, full_reads| full_reads >= 3);
    let result = ingestor.ingest_remote(Arc::new(RemoteFile::new(peer))).await;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(stored_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_failed_done_keeps_the_stored_package() {
    let (dir, ingestor) = store();
    let data = demo_ipa();
    let peer = ScriptedPeer::new(data.clone(), |command, _| {
        command.command == CommandKind::Done
    });

    let app = ingestor
        .ingest_remote(Arc::new(RemoteFile::new(peer)))
        .await
        .unwrap();
    let stored = dir.path().join(app.package_storage_name());
    assert_eq!(std::fs::read(stored).unwrap(), data);
}
