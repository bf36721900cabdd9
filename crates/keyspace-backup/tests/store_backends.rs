use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use keyspace_backup::collab::ObjectStore;
use keyspace_backup::config::{HttpStoreConfig, S3StoreConfig};
use keyspace_backup::store::{HttpStore, S3Store};

type Objects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

struct Request {
    method: String,
    target: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

fn read_request(stream: &TcpStream) -> Option<Request> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = BTreeMap::new();
    loop {
        let mut h = String::new();
        reader.read_line(&mut h).ok()?;
        let h = h.trim_end();
        if h.is_empty() {
            break;
        }
        if let Some((k, v)) = h.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut body = Vec::new();
    if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).ok()?;
            let size = usize::from_str_radix(size.trim().split(';').next()?, 16).ok()?;
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).ok()?;
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = headers.get("content-length").and_then(|v| v.parse().ok()) {
        body.resize(len, 0);
        reader.read_exact(&mut body).ok()?;
    }
    Some(Request {
        method,
        target,
        headers,
        body,
    })
}

fn respond(mut stream: &TcpStream, status: &str, body: &[u8]) {
    let _ = write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(body);
}

fn query_param(target: &str, name: &str) -> Option<String> {
    let (_, query) = target.split_once('?')?;
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == name).then(|| v.replace("%2F", "/"))
    })
}

/// One key per listing page, so paging is always exercised.
fn handle(req: Request, objects: &Objects, stream: &TcpStream) {
    if req.headers.get("authorization").map(String::as_str) != Some("Bearer s3cret") {
        respond(stream, "401 Unauthorized", b"");
        return;
    }
    let mut objects = objects.lock().unwrap();
    match req.method.as_str() {
        "PUT" => {
            objects.insert(req.target.trim_start_matches('/').to_string(), req.body);
            respond(stream, "200 OK", b"");
        }
        "GET" if query_param(&req.target, "list").is_some() => {
            let prefix = query_param(&req.target, "prefix").unwrap_or_default();
            let start = query_param(&req.target, "page").unwrap_or_default();
            let mut matching = objects
                .keys()
                .filter(|k| k.starts_with(&prefix) && k.as_str() >= start.as_str());
            let keys = matching.next().into_iter().cloned().collect::<Vec<_>>();
            let next = matching.next().cloned();
            let body = serde_json::json!({ "keys": keys, "next": next });
            respond(stream, "200 OK", body.to_string().as_bytes());
        }
        "GET" => match objects.get(req.target.trim_start_matches('/')) {
            Some(body) => respond(stream, "200 OK", body),
            None => respond(stream, "404 Not Found", b""),
        },
        _ => respond(stream, "405 Method Not Allowed", b""),
    }
}

fn spawn_object_server() -> (String, Objects) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let objects: Objects = Arc::default();
    let shared = objects.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if let Some(req) = read_request(&stream) {
                handle(req, &shared, &stream);
            }
        }
    });
    (format!("http://{addr}"), objects)
}

#[test]
fn http_store_puts_lists_across_pages_and_gets() {
    let (base, objects) = spawn_object_server();
    let store = HttpStore::new(&HttpStoreConfig {
        base_url: base,
        token: Some("s3cret".into()),
        timeout_secs: 10,
        ..Default::default()
    })
    .expect("store");

    for (key, body) in [
        ("/prod/ks/t1/t1/h1/data/ks/t/a.db.gz", "aaa"),
        ("/prod/ks/t1/t1/h2/data/ks/t/b.db.gz", "bbb"),
        ("/prod/other/t1/t1/h1/data/other/t/c.db.gz", "ccc"),
    ] {
        store
            .put_object(key, Box::new(std::io::Cursor::new(body.as_bytes().to_vec())))
            .expect("put");
    }
    assert_eq!(objects.lock().unwrap().len(), 3);

    let keys = store.list_keys("prod/ks/").expect("list");
    assert_eq!(
        keys,
        vec![
            "prod/ks/t1/t1/h1/data/ks/t/a.db.gz".to_string(),
            "prod/ks/t1/t1/h2/data/ks/t/b.db.gz".to_string(),
        ]
    );

    let mut body = String::new();
    store
        .get_object(&keys[1])
        .expect("get")
        .read_to_string(&mut body)
        .expect("read");
    assert_eq!(body, "bbb");

    assert!(store.get_object("prod/ks/missing.gz").is_err());
}

#[test]
fn http_store_rejects_bad_token() {
    let (base, _objects) = spawn_object_server();
    let store = HttpStore::new(&HttpStoreConfig {
        base_url: base,
        token: Some("wrong".into()),
        timeout_secs: 10,
        ..Default::default()
    })
    .expect("store");
    let err = store.list_keys("prod/").unwrap_err().to_string();
    assert!(err.contains("401"), "unexpected err: {err}");
}

struct DockerGuard {
    name: String,
}

impl Drop for DockerGuard {
    fn drop(&mut self) {
        let _ = Command::new("docker")
            .arg("rm")
            .arg("-f")
            .arg(&self.name)
            .status();
    }
}

fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_output(cmd: &mut Command) -> Output {
    cmd.output()
        .unwrap_or_else(|e| panic!("failed to run {:?}: {e}", cmd))
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
    panic!("condition not met within {timeout:?}");
}

#[test]
#[ignore = "requires docker and the aws cli"]
fn s3_store_against_minio() {
    if !have_bin("docker") || !have_bin("aws") {
        eprintln!("skip: missing docker/aws");
        return;
    }

    let port = free_port();
    let name = format!("ksbackup-minio-{}-{port}", std::process::id());
    let _guard = DockerGuard { name: name.clone() };
    let started = run_output(
        Command::new("docker")
            .arg("run")
            .arg("-d")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("-p")
            .arg(format!("{port}:9000"))
            .arg("-e")
            .arg("MINIO_ROOT_USER=minio")
            .arg("-e")
            .arg("MINIO_ROOT_PASSWORD=miniosecret")
            .arg("quay.io/minio/minio")
            .arg("server")
            .arg("/data"),
    );
    assert!(started.status.success(), "docker run failed");

    let endpoint = format!("http://127.0.0.1:{port}");
    let aws = |args: &[&str]| {
        let mut cmd = Command::new("aws");
        cmd.args(args)
            .arg("--endpoint-url")
            .arg(&endpoint)
            .env("AWS_ACCESS_KEY_ID", "minio")
            .env("AWS_SECRET_ACCESS_KEY", "miniosecret")
            .env("AWS_DEFAULT_REGION", "us-east-1");
        run_output(&mut cmd)
    };
    wait_for(Duration::from_secs(30), || {
        aws(&["s3api", "list-buckets"]).status.success()
    });
    assert!(aws(&["s3", "mb", "s3://ksbackup-test"]).status.success());

    unsafe {
        std::env::set_var("KSBACKUP_TEST_AWS_ACCESS_KEY_ID", "minio");
        std::env::set_var("KSBACKUP_TEST_AWS_SECRET_ACCESS_KEY", "miniosecret");
    }
    let store = S3Store::new(&S3StoreConfig {
        bucket: "ksbackup-test".into(),
        endpoint_url: Some(endpoint.clone()),
        aws_access_key_id_env: Some("KSBACKUP_TEST_AWS_ACCESS_KEY_ID".into()),
        aws_secret_access_key_env: Some("KSBACKUP_TEST_AWS_SECRET_ACCESS_KEY".into()),
        page_size: 1,
        ..Default::default()
    })
    .expect("store");

    for i in 0..3 {
        store
            .put_object(
                &format!("/prod/ks/t1/t1/h{i}/data/ks/t/f.db.gz"),
                Box::new(std::io::Cursor::new(format!("body-{i}").into_bytes())),
            )
            .expect("put");
    }
    let keys = store.list_keys("prod/ks/").expect("list");
    assert_eq!(keys.len(), 3);

    let mut body = String::new();
    store
        .get_object(&keys[2])
        .expect("get")
        .read_to_string(&mut body)
        .expect("read");
    assert_eq!(body, "body-2");
}
