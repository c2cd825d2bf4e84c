//! The server must outlive running out of file descriptors. The serving
//! side runs in a child copy of this test binary with a low descriptor
//! limit so the rest of the suite keeps its own.
extern crate sample_app;
extern crate libc;

use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use sample_app::{Server, MESSAGE};


const CHILD_ENV: &'static str = "SAMPLE_APP_FD_LIMIT_CHILD";
const FD_LIMIT: libc::rlim_t = 64;


fn lower_fd_limit() {
    unsafe {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit), 0);
        limit.rlim_cur = FD_LIMIT;
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &limit), 0);
    }
}

/// Child side: serve with a small descriptor budget until killed
fn serve_starved() {
    lower_fd_limit();
    let server = Server::bind("127.0.0.1:0").expect("bind").workers(2);
    println!("listening on {}", server.local_addr());
    io::stdout().flush().unwrap();
    if let Err(e) = server.serve(sample_app::respond) {
        println!("server stopped: {}", e);
        io::stdout().flush().unwrap();
        ::std::process::exit(1);
    }
}

fn spawn_child() -> (Child, SocketAddr) {
    let exe = env::current_exe().expect("test binary path");
    let mut child = Command::new(exe)
        .args(&["accept_survives_fd_exhaustion", "--exact", "--nocapture", "--test-threads=1", "-q"])
        .env(CHILD_ENV, "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serving child");
    let stdout = child.stdout.take().expect("child stdout");
    let mut lines = BufReader::new(stdout).lines();
    let addr = loop {
        let line = lines.next().expect("child exited before listening").expect("child output");
        if line.starts_with("listening on ") {
            break line["listening on ".len()..].trim().parse().expect("child address")
        }
    };
    (child, addr)
}

fn assert_alive(child: &mut Child) {
    if let Some(status) = child.try_wait().expect("poll child") {
        panic!("server died with {}", status);
    }
}


#[test]
fn accept_survives_fd_exhaustion() {
    if env::var(CHILD_ENV).is_ok() {
        return serve_starved()
    }
    let (mut child, addr) = spawn_child();

    // hold more connections than the child has descriptors for
    let held: Vec<TcpStream> = (0..2 * FD_LIMIT as usize)
        .map(|_| TcpStream::connect(addr).expect("connect"))
        .collect();
    thread::sleep(Duration::from_millis(300));
    assert_alive(&mut child);

    // queued in the backlog until descriptors come free
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
    drop(held);

    let mut out = vec![];
    stream.read_to_end(&mut out).expect("reply after descriptors freed");
    let out = String::from_utf8_lossy(&out);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {:?}", out);
    assert!(out.ends_with(MESSAGE), "reply: {:?}", out);

    assert_alive(&mut child);
    let _ = child.kill();
    let _ = child.wait();
}
