use std::sync::Arc;

use agent_manager::bridge::capture::{LineSplitter, OutputCapture};
use agent_manager::persistence::db;
use agent_manager::persistence::output_repo::OutputRepo;

#[test]
fn splits_on_newlines_and_keeps_partial_tail() {
    let mut splitter = LineSplitter::new();
    assert_eq!(splitter.feed(b"par"), Vec::<String>::new());
    assert_eq!(splitter.feed(b"tial\nrest"), vec!["partial".to_owned()]);
    assert_eq!(splitter.finish(), Some("rest".to_owned()));
    assert_eq!(splitter.finish(), None);
}

#[test]
fn drops_carriage_returns_and_trailing_space() {
    let mut splitter = LineSplitter::new();
    let lines = splitter.feed(b"hello   \r\nworld\r\n");
    assert_eq!(lines, vec!["hello".to_owned(), "world".to_owned()]);
}

#[test]
fn strips_csi_sequences() {
    let mut splitter = LineSplitter::new();
    let lines = splitter.feed(b"\x1b[1;31mred\x1b[0m and \x1b[2Jplain\n");
    assert_eq!(lines, vec!["red and plain".to_owned()]);
}

#[test]
fn strips_osc_with_either_terminator() {
    let mut splitter = LineSplitter::new();
    let lines = splitter.feed(b"\x1b]0;title\x07first\n\x1b]2;t\x1b\\second\n");
    assert_eq!(lines, vec!["first".to_owned(), "second".to_owned()]);
}

#[test]
fn escape_split_across_chunks() {
    let mut splitter = LineSplitter::new();
    assert!(splitter.feed(b"a\x1b[").is_empty());
    assert_eq!(splitter.feed(b"32mb\n"), vec!["ab".to_owned()]);
}

#[test]
fn keeps_tabs_and_drops_other_controls() {
    let mut splitter = LineSplitter::new();
    let lines = splitter.feed(b"a\tb\x07\x08c\n");
    assert_eq!(lines, vec!["a\tbc".to_owned()]);
}

#[test]
fn overlong_line_is_flushed() {
    let mut splitter = LineSplitter::new();
    let chunk = vec![b'x'; 16 * 1024 + 10];
    let lines = splitter.feed(&chunk);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].len(), 16 * 1024);
    assert_eq!(splitter.finish().map(|l| l.len()), Some(10));
}

#[test]
fn invalid_utf8_is_replaced() {
    let mut splitter = LineSplitter::new();
    let lines = splitter.feed(b"ok \xff\n");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("ok "));
}

#[tokio::test]
async fn capture_writes_terminal_lines() {
    let repo = OutputRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let mut capture = OutputCapture::spawn(repo.clone(), "c1".into());

    capture.feed(b"$ make\r\n\x1b[32mok\x1b[0m\r\n\r\n");
    capture.feed(b"tail without newline");
    capture.finish().await;

    let lines = repo.list("c1", None).await.expect("list");
    let contents: Vec<_> = lines.iter().map(|l| l.content.as_str()).collect();
    assert_eq!(contents, vec!["$ make", "ok", "tail without newline"]);
}
