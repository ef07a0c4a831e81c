use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use poster::wire::{Reply, Request};
use poster::{
    Config, Context, Error, IoctlCmd, IoctlReply, Node, NodeConfig, Op, PosterServer, RpcClient,
    Wait,
};

const WAIT_DURATION: Duration = Duration::from_secs(5);
const WAIT: Wait = Wait::Timeout(WAIT_DURATION);

fn server() -> (Arc<Node>, SocketAddr) {
    let node = Node::anonymous(&NodeConfig::default()).unwrap();
    let server = PosterServer::bind(node.clone(), "127.0.0.1:0", WAIT).unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn();
    (node, addr)
}

/// A process whose posters all live on `addr`.
fn remote_context(addr: SocketAddr) -> Context {
    let config = Config {
        remote_host: Some(addr.to_string()),
        wait: WAIT,
        ..Config::default()
    };
    Context::new(config, None)
}

/// A process without a node of its own, searching `addr`.
fn searching_context(addr: SocketAddr) -> Context {
    let config = Config {
        search_path: vec![addr.to_string()],
        wait: WAIT,
        ..Config::default()
    };
    Context::new(config, None)
}

#[test]
fn written_on_one_host_read_on_another() {
    let (node, addr) = server();
    let mut a = remote_context(addr);
    let mut b = searching_context(addr);

    let mut speed = a.create("speed", 8).unwrap();
    assert!(!speed.is_local());

    let mut taken = a.take(&mut speed, Op::Write).unwrap();
    taken.data_mut().unwrap().copy_from_slice(&42u64.to_be_bytes());
    taken.give().unwrap();

    let mut found = b.find("speed").unwrap();
    assert_eq!(found.endianness(), speed.endianness());
    let taken = b.take(&mut found, Op::Read).unwrap();
    assert_eq!(taken.data(), 42u64.to_be_bytes());
    taken.give().unwrap();

    // The server's own node holds the same bytes.
    let local = node.find("speed").unwrap();
    let mut buf = [0; 8];
    local.read(0, &mut buf, WAIT).unwrap();
    assert_eq!(buf, 42u64.to_be_bytes());
}

#[test]
fn partial_reads_and_writes() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    let mut poster = a.create("partial", 6).unwrap();

    assert_eq!(a.write(&mut poster, 4, b"xyz").unwrap(), 2);
    let mut buf = [0; 4];
    assert_eq!(a.read(&mut poster, 3, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"\0xy");
    assert!(matches!(
        a.read(&mut poster, 7, &mut buf),
        Err(Error::BadOperation(_))
    ));
}

#[test]
fn never_written_posters_can_only_be_taken_for_writing() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    let mut poster = a.create("blank", 4).unwrap();

    assert!(matches!(
        a.take(&mut poster, Op::Read).map(drop),
        Err(Error::ClosedOrEmpty)
    ));

    let taken = a.take(&mut poster, Op::Write).unwrap();
    assert_eq!(taken.data(), [0; 4]);
    taken.give().unwrap();

    // Giving a write access counts as a write.
    let taken = a.take(&mut poster, Op::Read).unwrap();
    assert_eq!(taken.data(), [0; 4]);
    taken.give().unwrap();
    assert_eq!(
        a.ioctl(&mut poster, IoctlCmd::Fresh).unwrap(),
        IoctlReply::Fresh(true)
    );
}

#[test]
fn only_the_creator_resizes() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    let mut b = searching_context(addr);

    let mut created = a.create("sized", 4).unwrap();
    a.write(&mut created, 0, b"abcd").unwrap();
    let mut found = b.find("sized").unwrap();
    assert!(matches!(b.resize(&mut found, 8), Err(Error::NotOwner)));

    a.resize(&mut created, 8).unwrap();
    a.resize(&mut created, 8).unwrap();
    assert_eq!(a.size(&mut created), 8);
    assert_eq!(
        a.ioctl(&mut created, IoctlCmd::GetSize).unwrap(),
        IoctlReply::Size(8)
    );

    let mut found = b.find("sized").unwrap();
    assert_eq!(b.size(&mut found), 8);
    let taken = b.take(&mut found, Op::Read).unwrap();
    assert_eq!(taken.data(), b"abcd\0\0\0\0");
}

#[test]
fn deletion_is_seen_by_other_hosts() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    let mut b = searching_context(addr);

    let mut created = a.create("short-lived", 4).unwrap();
    a.write(&mut created, 0, b"gone").unwrap();
    let mut found = b.find("short-lived").unwrap();

    a.delete(&mut created).unwrap();
    assert!(matches!(b.find("short-lived"), Err(Error::NotFound)));
    assert!(matches!(
        b.take(&mut found, Op::Read).map(drop),
        Err(Error::ClosedOrEmpty)
    ));
    assert!(matches!(a.find("short-lived"), Err(Error::NotFound)));
}

#[test]
fn duplicate_names_are_refused_remotely() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    a.create("twice", 4).unwrap();
    assert!(matches!(a.create("twice", 4), Err(Error::DuplicateName)));
    assert!(matches!(a.create("empty", 0), Err(Error::BadOperation(_))));
}

#[test]
fn second_server_on_the_same_address() {
    let (node, addr) = server();
    let second = PosterServer::bind(node, addr, WAIT);
    assert!(matches!(second, Err(Error::AlreadyRunning(_))));
}

#[test]
fn unknown_ids_and_codes() {
    let (_node, addr) = server();
    let mut client = RpcClient::connect(&addr.to_string(), Some(WAIT_DURATION)).unwrap();

    let stale = Request::Read {
        id: 0xdead_0000_0001,
        offset: 0,
        len: None,
    };
    assert!(matches!(
        client.call(&stale),
        Err(Error::ProtocolCorruption(_))
    ));

    let Ok(Reply::Created { id }) = client.call(&Request::Create {
        name: "ioctl".into(),
        len: 4,
        endianness: poster::Endianness::native(),
    }) else {
        panic!("create failed");
    };

    let bad = Request::Ioctl { id, cmd: 0x42 };
    assert!(matches!(client.call(&bad), Err(Error::BadIoctlCode(_))));

    // Errors reported by the server leave the connection usable.
    assert!(!client.is_broken());
    let date = Request::Ioctl {
        id,
        cmd: IoctlCmd::GetDate.code(),
    };
    assert!(matches!(
        client.call(&date),
        Ok(Reply::Ioctl(IoctlReply::Date(_)))
    ));
}

#[test]
fn unreachable_hosts_are_skipped_on_the_search_path() {
    let (node, addr) = server();
    node.create("beyond", 4).unwrap();

    // Nothing listens on the first entry.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let config = Config {
        search_path: vec![dead.to_string(), addr.to_string()],
        wait: WAIT,
        ..Config::default()
    };
    let mut ctx = Context::new(config, None);
    let mut found = ctx.find("beyond").unwrap();
    assert_eq!(ctx.size(&mut found), 4);
}

/// A process that owns the server's node, reaching its posters without RPC.
fn local_context(node: &Arc<Node>) -> Context {
    let config = Config {
        wait: WAIT,
        ..Config::default()
    };
    Context::new(config, Some(node.clone()))
}

#[test]
fn local_creator_and_remote_writer_share_a_poster() {
    let (node, addr) = server();
    let mut a = local_context(&node);
    let mut b = remote_context(addr);

    let mut x = a.create("X", 64).unwrap();
    assert!(x.is_local());

    let mut found = b.find("X").unwrap();
    assert!(!found.is_local());
    assert_eq!(found.endianness(), x.endianness());

    let pattern: Vec<u8> = (0..64).collect();
    let mut taken = b.take(&mut found, Op::Write).unwrap();
    taken.data_mut().unwrap().copy_from_slice(&pattern);
    taken.give().unwrap();

    let taken = a.take(&mut x, Op::Read).unwrap();
    assert_eq!(taken.data(), pattern);
    taken.give().unwrap();

    a.resize(&mut x, 256).unwrap();

    let taken = b.take(&mut found, Op::Read).unwrap();
    assert_eq!(taken.data().len(), 256);
    assert_eq!(&taken.data()[..64], pattern);
    assert!(taken.data()[64..].iter().all(|&byte| byte == 0));
}

#[test]
fn write_take_of_an_empty_poster_follows_its_resizes() {
    let (node, addr) = server();
    let mut a = local_context(&node);
    let mut b = remote_context(addr);

    let mut y = a.create("Y", 64).unwrap();
    let mut found = b.find("Y").unwrap();
    assert_eq!(b.size(&mut found), 64);

    a.resize(&mut y, 256).unwrap();

    let mut taken = b.take(&mut found, Op::Write).unwrap();
    assert_eq!(taken.data(), [0; 256]);
    taken.data_mut().unwrap()[255] = 0xaa;
    taken.give().unwrap();

    let taken = a.take(&mut y, Op::Read).unwrap();
    assert_eq!(taken.data().len(), 256);
    assert_eq!(taken.data()[255], 0xaa);
}

#[test]
fn ranged_reads_of_an_empty_poster_see_zeros() {
    let (_node, addr) = server();
    let mut a = remote_context(addr);
    let mut poster = a.create("zeros", 4).unwrap();

    let mut buf = [0xff; 4];
    assert_eq!(a.read(&mut poster, 0, &mut buf).unwrap(), 4);
    assert_eq!(buf, [0; 4]);

    // Taking it to read still finds nothing written.
    assert!(matches!(
        a.take(&mut poster, Op::Read).map(drop),
        Err(Error::ClosedOrEmpty)
    ));
}

#[test]
fn search_path_from_the_environment_carries_ports() {
    let (node, addr) = server();
    node.create("ported", 4).unwrap();

    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let path = format!("[{}]:{}:[{}]:{}", dead.ip(), dead.port(), addr.ip(), addr.port());
    let mut ctx = Context::new(Config::from_vars(None, Some(&path), Some("5000")).unwrap(), None);
    let mut found = ctx.find("ported").unwrap();
    assert_eq!(ctx.size(&mut found), 4);
}
