use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};

use assert_cmd::cargo::CommandCargoExt;
use poster::{Config, Context, Op, Wait};

/// Kills the server when the test ends, passing or not.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn posterd(listen: &str) -> (Server, String) {
    let mut child = Command::cargo_bin("posterd")
        .unwrap()
        .args(["--listen", listen, "--arena-size", "65536"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    let addr = line
        .trim()
        .strip_prefix("listening on ")
        .unwrap_or_else(|| panic!("unexpected output {line:?}"))
        .to_owned();

    (Server(child), addr)
}

#[test]
fn posterd_serves_remote_contexts() {
    let (_server, addr) = posterd("127.0.0.1:0");

    let config = Config {
        remote_host: Some(addr.clone()),
        wait: Wait::Timeout(std::time::Duration::from_secs(5)),
        ..Config::default()
    };
    let mut ctx = Context::new(config, None);

    let mut poster = ctx.create("remote", 3).unwrap();
    let mut taken = ctx.take(&mut poster, Op::Write).unwrap();
    taken.data_mut().unwrap().copy_from_slice(b"abc");
    taken.give().unwrap();

    let mut other = Context::new(
        Config {
            search_path: vec![addr],
            ..Config::default()
        },
        None,
    );
    let mut found = other.find("remote").unwrap();
    let mut buf = [0; 3];
    assert_eq!(other.read(&mut found, 0, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"abc");
}

#[test]
fn posterd_refuses_a_taken_address() {
    let (_server, addr) = posterd("127.0.0.1:0");

    let assert = assert_cmd::Command::cargo_bin("posterd")
        .unwrap()
        .args(["--listen", &addr])
        .assert()
        .failure();

    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("already answers"), "{stderr}");
}

#[test]
fn poster_host_hands_down_the_segment() {
    assert_cmd::Command::cargo_bin("poster-host")
        .unwrap()
        .args(["--size", "65536", "--", "sh", "-c", "echo $LISTEN_FDS $LISTEN_FDNAMES"])
        .env_remove("LISTEN_FDS")
        .env_remove("LISTEN_FDNAMES")
        .env_remove("LISTEN_PID")
        .assert()
        .success()
        .stdout("1 POSTER_ARENA_FD\n");
}

#[test]
fn posterd_attaches_to_a_hosted_segment() {
    let posterd = assert_cmd::cargo::cargo_bin("posterd");
    let mut child = Command::cargo_bin("poster-host")
        .unwrap()
        .args(["--size", "65536", "--max-posters", "4", "--"])
        .arg(posterd)
        .args(["--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "poster=debug")
        .env_remove("LISTEN_FDS")
        .env_remove("LISTEN_FDNAMES")
        .env_remove("LISTEN_PID")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert!(line.starts_with("listening on "), "{line:?}");

    let stderr = child.stderr.take().unwrap();
    let server = Server(child);
    drop(server);

    let mut log = String::new();
    std::io::Read::read_to_string(&mut BufReader::new(stderr), &mut log).unwrap();
    assert!(log.contains("attached poster node"), "{log}");
}
