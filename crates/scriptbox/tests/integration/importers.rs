use std::{
    collections::BTreeMap,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::join_all;
use scriptbox::{
    AppOptions, AppletManager, Error, ManagerConfig, ModuleDefinition, ModuleGetter, Registry,
    RegistryTable, Require, Value,
    importer::{ArchiveImporter, Unpacker, UrlImporter, archive::MANIFEST},
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};
use zip::write::SimpleFileOptions;

use super::common::{MemFs, ToyEngine, applet, init_tracing, options};

fn write_archive(path: &Path, entries: &[(&str, &str)]) -> Result<()> {
    let mut w = zip::ZipWriter::new(std::fs::File::create(path)?);
    for (name, body) in entries {
        w.start_file(*name, SimpleFileOptions::default())?;
        w.write_all(body.as_bytes())?;
    }
    w.finish()?;
    Ok(())
}

fn kit_archive(dir: &Path) -> Result<PathBuf> {
    let archive = dir.join("kit.zip");
    write_archive(
        &archive,
        &[
            (MANIFEST, "name: kit\nversion: 1.2.0\n"),
            ("lib/util.box", "let answer = 42"),
            ("lib/index.box", "let entry = 1"),
        ],
    )?;
    Ok(archive)
}

#[tokio::test]
async fn unpack_is_idempotent_across_unpackers() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let archive = kit_archive(dir.path())?;
    let dest = dir.path().join("modules");

    let first = Unpacker::new(&dest);
    let root = first.unpack(&archive).await?;
    assert_eq!(root, dest.join("kit@1.2.0"));
    assert_eq!(first.unpack(&archive).await?, root);
    assert_eq!(first.extractions(), 1);

    let second = Unpacker::new(&dest);
    assert_eq!(second.unpack(&archive).await?, root);
    assert_eq!(second.extractions(), 0, "existing directory is reused");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unpacks_extract_once() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let archive = kit_archive(dir.path())?;
    let unpacker = Arc::new(Unpacker::new(dir.path().join("modules")));

    let unpacks = (0..8).map(|_| {
        let unpacker = Arc::clone(&unpacker);
        let archive = archive.clone();
        tokio::spawn(async move { unpacker.unpack(&archive).await })
    });
    let roots = join_all(unpacks)
        .await
        .into_iter()
        .map(|r| -> Result<_> { Ok(r.context("join")??) })
        .collect::<Result<Vec<_>>>()?;

    assert!(roots.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(unpacker.extractions(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_archive_is_a_read_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let unpacker = Unpacker::new(dir.path().join("modules"));
    let err = unpacker
        .unpack(&dir.path().join("absent.zip"))
        .await
        .expect_err("no archive");
    assert!(err.is_not_found(), "{err}");
    Ok(())
}

#[tokio::test]
async fn archive_importer_serves_package_sources() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let archive = kit_archive(dir.path())?;
    let unpacker = Unpacker::new(dir.path().join("modules"));
    let applet = applet(MemFs::new(), ToyEngine::new()).await;

    let importer = ArchiveImporter::for_applet(&unpacker, &archive, &applet).await?;
    match importer.get("lib/util").await {
        Some(ModuleDefinition::Source(src)) => assert_eq!(&src[..], b"let answer = 42"),
        other => anyhow::bail!("unexpected module {other:?}"),
    }
    assert!(importer.get("lib/missing").await.is_none());

    applet.with_importer(Arc::new(importer));
    let unit = applet
        .run(
            b"import lib\nimport lib/util\nlet a = lib/util.answer\nlet e = lib.entry".to_vec(),
            BTreeMap::new(),
            &CancellationToken::new(),
            "main",
        )
        .await?;
    assert_eq!(unit.get("a"), Some(Value::Int(42)));
    assert_eq!(unit.get("e"), Some(Value::Int(1)));
    Ok(())
}

#[tokio::test]
async fn url_importer_fetches_once() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mod.box"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("let remote = 7")
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let importer = Arc::new(UrlImporter::new());
    let url = format!("{}/mod.box", server.uri());
    let (a, b) = tokio::join!(importer.fetch(&url), importer.fetch(&url));
    assert_eq!(a?, b?);
    let third = importer.fetch(&url).await.context("cached fetch")?;
    assert_eq!(&third[..], b"let remote = 7");
    assert_eq!(importer.fetches(), 1);

    let applet = applet(MemFs::new(), ToyEngine::new()).await;
    applet.with_importer(importer);
    let unit = applet
        .run(
            format!("import {url}\nlet ok = 1").into_bytes(),
            BTreeMap::new(),
            &CancellationToken::new(),
            "main",
        )
        .await
        .context("import by url")?;
    assert_eq!(unit.get("ok"), Some(Value::Int(1)));
    Ok(())
}

#[tokio::test]
async fn url_failures_are_not_cached() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.box"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such module"))
        .expect(2)
        .mount(&server)
        .await;

    let importer = UrlImporter::new();
    let url = format!("{}/gone.box", server.uri());
    let err = importer.fetch(&url).await.expect_err("404");
    assert!(
        matches!(err, Error::Fetch { status: 404, ref body, .. } if body == "no such module"),
        "{err}"
    );
    assert!(importer.get(&url).await.is_none());
    assert_eq!(importer.fetches(), 2);
    Ok(())
}

struct Workspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config: ManagerConfig,
}

fn workspace() -> Result<Workspace> {
    let dir = tempfile::tempdir()?;
    let repo = dir.path().join("repo");
    let root = dir.path().join("app");
    let public = dir.path().join("public");
    std::fs::create_dir_all(&repo)?;
    std::fs::create_dir_all(&root)?;
    std::fs::create_dir_all(&public)?;
    write_archive(
        &repo.join("kit@1.2.0.zip"),
        &[
            (MANIFEST, "name: kit\nversion: 1.2.0\n"),
            ("lib/util.box", "let answer = 42"),
        ],
    )?;
    std::fs::write(public.join("shared.box"), "let greeting = hi")?;
    std::fs::write(
        root.join("main.box"),
        "import db\nimport lib/util\nimport shared\n\
         let a = lib/util.answer\nlet g = shared.greeting\nlet k = db.kind",
    )?;

    let config = ManagerConfig {
        repo_source: repo,
        repo_dest: dir.path().join("modules"),
        public_dirs: vec![public],
        ..ManagerConfig::default()
    };
    Ok(Workspace {
        _dir: dir,
        root,
        config,
    })
}

fn app(name: &str, root: &Path, requires: Vec<Require>) -> AppOptions {
    let mut options = options(name);
    options.root(root);
    AppOptions {
        options,
        modules: vec!["db".to_string()],
        requires,
    }
}

fn manager(config: ManagerConfig) -> AppletManager {
    let table = RegistryTable::new().with_registry(Registry::new("db").with_value("kind", "pg"));
    AppletManager::new(config, Arc::new(table), ToyEngine::new())
}

#[tokio::test]
async fn manager_wires_registries_packages_and_public_dirs() -> Result<()> {
    init_tracing();
    let ws = workspace()?;
    let manager = manager(ws.config.clone());

    let applet = manager
        .open(app("shop", &ws.root, vec![Require::new("kit", "1.2.0")]))
        .await?;
    assert_eq!(manager.names(), ["shop"]);

    let unit = applet
        .run_file("main.box", BTreeMap::new(), &CancellationToken::new())
        .await?;
    assert_eq!(unit.get("a"), Some(Value::Int(42)));
    assert_eq!(unit.get("g"), Some(Value::from("hi")));
    assert_eq!(unit.get("k"), Some(Value::from("pg")));
    assert!(ws.config.repo_dest.join("kit@1.2.0/lib/util.box").is_file());
    Ok(())
}

#[tokio::test]
async fn manager_rejects_duplicates_and_unknown_names() -> Result<()> {
    init_tracing();
    let ws = workspace()?;
    let manager = manager(ws.config.clone());

    let first = manager.open(app("shop", &ws.root, Vec::new())).await?;
    let err = manager
        .open(app("shop", &ws.root, Vec::new()))
        .await
        .expect_err("duplicate");
    assert!(matches!(err, Error::DuplicateSandboxName(ref n) if n == "shop"), "{err}");
    assert!(!first.is_closed());

    let err = manager.close("nope", "test").await.expect_err("unknown");
    assert!(matches!(err, Error::UnknownSandbox(ref n) if n == "nope"), "{err}");

    let err = manager
        .open(app("broken", &ws.root, vec![Require::new("absent", "")]))
        .await
        .expect_err("missing package");
    assert!(err.is_not_found(), "{err}");
    assert!(manager.get("broken").is_none());
    Ok(())
}

#[tokio::test]
async fn manager_closes_and_shuts_down() -> Result<()> {
    init_tracing();
    let ws = workspace()?;
    let manager = manager(ws.config.clone());

    let a = manager.open(app("a", &ws.root, Vec::new())).await?;
    let b = manager.open(app("b", &ws.root, Vec::new())).await?;
    let c = manager.open(app("c", &ws.root, Vec::new())).await?;
    assert_eq!(manager.len(), 3);

    manager.close("a", "test").await?;
    assert!(a.is_closed());
    assert_eq!(manager.names(), ["b", "c"]);

    manager.shutdown_all("test over").await;
    assert!(manager.is_empty());
    assert!(b.is_closed() && c.is_closed());
    Ok(())
}
