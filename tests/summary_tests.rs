//! Integration tests for the mbox parser, folder summaries, and the mbox store.

use std::path::Path;
use std::sync::Arc;

use assert_fs::prelude::*;
use predicates::prelude::*;

use mailsummary::config::Config;
use mailsummary::model::flags::MessageFlags;
use mailsummary::model::message_id::MessageId;
use mailsummary::model::message_info::{MessageInfoView, SharedMessageInfo};
use mailsummary::parser::mbox::MboxParser;
use mailsummary::store::mbox::summary_path_for;
use mailsummary::store::MboxFolder;
use mailsummary::summary::vee::vee_uid;
use mailsummary::summary::{
    LoadOutcome, MboxBackend, MboxSummary, SummaryContext, SummaryOptions, VeeSummary,
};
use mailsummary::SummaryError;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.cache_dir = Some(dir.join("cache"));
    config.summary.fsync = false;
    config
}

/// A private copy of the fixture mbox.
fn workspace() -> (assert_fs::TempDir, std::path::PathBuf) {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("simple.mbox")
        .write_file(&fixture("simple.mbox"))
        .unwrap();
    let path = temp.path().join("simple.mbox");
    (temp, path)
}

// ─── Parser ─────────────────────────────────────────────────────────

#[test]
fn test_parse_simple_mbox_count() {
    let parser = MboxParser::new(fixture("simple.mbox")).unwrap();
    let mut offsets = Vec::new();
    let count = parser
        .parse(
            &mut |message| {
                assert!(message.data.starts_with(b"From "));
                assert!(!message.is_truncated());
                offsets.push(message.offset);
                true
            },
            None,
        )
        .unwrap();
    assert_eq!(count, 5, "simple.mbox should contain exactly 5 messages");
    assert_eq!(offsets[0], 0);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
}

// ─── Mbox store ─────────────────────────────────────────────────────

#[test]
fn test_open_summarises_every_message() {
    let (temp, path) = workspace();
    let folder = MboxFolder::open(&path, &test_config(temp.path()), SummaryContext::shared()).unwrap();

    temp.child(".simple.mbox.summary")
        .assert(predicate::path::exists());

    let summary = folder.summary();
    assert_eq!(summary.count(), 5);
    assert_eq!(summary.uids().len(), 5);
    assert_eq!(summary.next_uid(), 6);

    let counts = folder.counts();
    assert_eq!(counts.total, 5);
    assert_eq!(counts.unread, 4);

    let first = summary.uid("1").unwrap();
    assert_eq!(&*first.subject(), "Hello World");
    assert!(first.flags().contains(MessageFlags::SEEN));
    assert!(first.from().contains("user1@example.com"));

    let second = summary.uid("2").unwrap();
    assert!(second.flags().contains(MessageFlags::ANSWERED));
    assert_eq!(
        second.references(),
        vec![MessageId::from_header("<msg001@example.com>")]
    );
    assert_eq!(first.message_id(), MessageId::from_header("<msg001@example.com>"));

    let news = summary.uid("3").unwrap();
    assert_eq!(&*news.subject(), "Café weekly");
    assert!(!news.mlist().is_empty());

    let report = summary.uid("4").unwrap();
    assert!(report.flags().contains(MessageFlags::ATTACHMENTS));
    let content = report.content().expect("content tree");
    assert!(content.content_type.is("multipart", "mixed"));
    assert_eq!(content.children.len(), 2);

    let lunch = summary.uid("5").unwrap();
    assert!(lunch.flags().contains(MessageFlags::FLAGGED));
}

#[test]
fn test_summary_file_reloads_without_the_mbox() {
    let (temp, path) = workspace();
    let config = test_config(temp.path());
    {
        let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        folder
            .set_flags("3", MessageFlags::SEEN, MessageFlags::SEEN)
            .unwrap();
        assert!(folder.summary().uid("3").unwrap().set_user_tag("label", Some("news")));
        folder.save().unwrap();
    }

    let (summary, outcome) = MboxSummary::open(
        summary_path_for(&path),
        MboxBackend,
        SummaryContext::shared(),
        SummaryOptions::default(),
    )
    .unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            records: 5,
            version: 15
        }
    );
    assert_eq!(summary.name(), "simple.mbox");
    let news = summary.uid("3").unwrap();
    assert!(news.flags().contains(MessageFlags::SEEN));
    assert_eq!(news.user_tag("label").as_deref(), Some("news"));
    assert!(news.extra().from_offset > 0);
    assert_eq!(summary.backend_header().folder_size, std::fs::metadata(&path).unwrap().len());
}

#[test]
fn test_reading_messages_by_uid() {
    let (temp, path) = workspace();
    let mut folder = MboxFolder::open(&path, &test_config(temp.path()), SummaryContext::shared()).unwrap();
    let raw = folder.get_message("5").unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("From user4@example.com"));
    assert!(text.contains("free for lunch"));
    assert!(matches!(folder.get_message("42"), Err(SummaryError::UnknownUid(_))));
}

#[test]
fn test_expunge_removes_deleted_messages() {
    let (temp, path) = workspace();
    let config = test_config(temp.path());
    let mut folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
    folder
        .set_flags("4", MessageFlags::DELETED, MessageFlags::DELETED)
        .unwrap();
    assert_eq!(folder.counts().deleted, 1);

    let report = folder.expunge(false).unwrap();
    assert_eq!(report.expunged, 1);
    assert_eq!(report.kept, 4);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(predicate::str::contains("quarterly").not().eval(&contents));
    temp.child("simple.mbox")
        .assert(predicate::str::contains("free for lunch"));

    let raw = folder.get_message("5").unwrap();
    assert!(raw.starts_with(b"From user4@example.com"));

    drop(folder);
    let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
    let uids: Vec<String> = folder.summary().uids().iter().map(|u| u.to_string()).collect();
    assert_eq!(uids, ["1", "2", "3", "5"]);
    assert_eq!(folder.last_sync().kept, 4);
}

#[test]
fn test_rewritten_mbox_keeps_uids_and_flags() {
    let (temp, path) = workspace();
    let config = test_config(temp.path());
    {
        let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        folder
            .set_flags("2", MessageFlags::FLAGGED, MessageFlags::FLAGGED)
            .unwrap();
        folder.save().unwrap();
    }

    // Another program drops the first message.
    let contents = std::fs::read_to_string(&path).unwrap();
    let second = contents.find("From user2@example.com").unwrap();
    std::fs::write(&path, &contents[second..]).unwrap();

    let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
    let report = folder.last_sync();
    assert!(report.full);
    assert_eq!(report.removed, 1);
    assert_eq!(report.kept, 4);
    let moved = folder.summary().uid("2").unwrap();
    assert_eq!(&*moved.subject(), "Re: Hello World");
    assert!(moved.flags().contains(MessageFlags::FLAGGED));
    assert_eq!(moved.extra().from_offset, 0);
    assert!(folder.summary().uid("1").is_none());
}

#[test]
fn test_corrupt_summary_is_rebuilt() {
    let (temp, path) = workspace();
    let config = test_config(temp.path());
    drop(MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap());

    let summary_file = temp.child(".simple.mbox.summary");
    let bytes = std::fs::read(summary_file.path()).unwrap();
    summary_file.write_binary(&bytes[..bytes.len() / 2]).unwrap();

    let strict = MboxSummary::new(
        summary_file.path(),
        MboxBackend,
        SummaryContext::shared(),
        SummaryOptions::default(),
    );
    assert!(matches!(strict.load(), Err(SummaryError::Corrupt { .. })));

    let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
    assert_eq!(folder.summary().count(), 5);
    assert!(folder.last_sync().full);
}

#[test]
fn test_body_index_search() {
    let (temp, path) = workspace();
    let mut config = test_config(temp.path());
    config.summary.index_bodies = true;
    let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
    assert_eq!(folder.search("pastries"), vec!["3".to_string()]);
    assert_eq!(folder.search("QUARTERLY"), vec!["4".to_string()]);
    assert!(folder.search("nonexistentword").is_empty());
}

// ─── Virtual folders ────────────────────────────────────────────────

#[test]
fn test_virtual_folder_over_two_mboxes() {
    let (temp, path) = workspace();
    temp.child("other.mbox")
        .write_file(&fixture("simple.mbox"))
        .unwrap();
    let config = test_config(temp.path());
    let context = SummaryContext::shared();
    let inbox = MboxFolder::open(&path, &config, Arc::clone(&context)).unwrap();
    let other = MboxFolder::open(temp.path().join("other.mbox"), &config, Arc::clone(&context)).unwrap();

    // The same message ids now live in two folders.
    let owners = context
        .message_ids
        .owners(MessageId::from_header("<msg001@example.com>"));
    assert_eq!(owners.len(), 2);

    let vee = VeeSummary::new("all");
    assert_eq!(vee.add_folder(inbox.summary()), 5);
    assert_eq!(vee.add_folder(other.summary()), 5);
    assert_eq!(vee.count(), 10);

    let uid = vee_uid("other.mbox", "1");
    let info = vee.uid(&uid).unwrap();
    assert_eq!(&*info.subject(), "Hello World");
    info.set_flags(MessageFlags::FLAGGED, MessageFlags::FLAGGED);
    assert!(other.summary().uid("1").unwrap().flags().contains(MessageFlags::FLAGGED));
    assert!(!inbox.summary().uid("1").unwrap().flags().contains(MessageFlags::FLAGGED));

    other.summary().remove_uid("1");
    assert_eq!(vee.count(), 9);
    assert_eq!(vee.remove_source("simple.mbox"), 5);
    assert_eq!(vee.count(), 4);
}
