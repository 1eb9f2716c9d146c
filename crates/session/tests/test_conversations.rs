//! Conversation transcripts and the store that persists them

use chrono::{Duration, Local};
use labrelay_session::{Conversation, ConversationStore};
use tempfile::TempDir;

fn store(dir: &TempDir) -> ConversationStore {
    ConversationStore::new(dir.path())
}

// ============================================================================
// Conversation
// ============================================================================

#[test]
fn test_new_conversation_is_fresh() {
    let conversation = Conversation::new("cli:default");
    assert_eq!(conversation.key, "cli:default");
    assert!(conversation.is_fresh());
    assert_eq!(conversation.created_at, conversation.updated_at);
}

#[test]
fn test_truncates_to_max_messages() {
    let mut conversation = Conversation::with_max_messages("k", 3);
    for i in 0..5 {
        conversation.add_message("user", format!("m{}", i));
    }
    let contents: Vec<&str> = conversation.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m2", "m3", "m4"]);
}

#[test]
fn test_history_takes_latest() {
    let mut conversation = Conversation::new("k");
    conversation.add_message("user", "plan an amplifier");
    conversation.add_message("assistant", "plan a1b2c3d4 proposed");
    conversation.add_message("user", "confirm");

    let history = conversation.history(2);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "assistant");
    assert_eq!(history[1].content.as_deref(), Some("confirm"));
    assert!(conversation.history(50).len() == 3);
}

#[test]
fn test_idle_and_restart() {
    let mut conversation = Conversation::new("k");
    conversation.add_message("user", "hello");
    conversation.metadata.insert("note".to_string(), serde_json::json!(1));

    let later = Local::now() + Duration::minutes(61);
    assert!(conversation.is_idle(Duration::minutes(60), later));
    assert!(!conversation.is_idle(Duration::minutes(60), Local::now()));

    conversation.restart();
    assert!(conversation.is_fresh());
    assert!(conversation.metadata.is_empty());
}

// ============================================================================
// ConversationStore
// ============================================================================

#[tokio::test]
async fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = store(&dir);
        let conversation = store.get_or_create("cli:bench").await;
        conversation.add_message("user", "list libraries");
        conversation.add_message("assistant", "demo_lib, ads_rflib");
        store.save_key("cli:bench").await.unwrap();
    }

    assert!(dir.path().join("cli_bench.json").exists());

    let mut reopened = store(&dir);
    let conversation = reopened.get_or_create("cli:bench").await;
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].content, "demo_lib, ads_rflib");
}

#[tokio::test]
async fn test_reload_applies_current_limit() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = store(&dir);
        let conversation = store.get_or_create("k").await;
        for i in 0..10 {
            conversation.add_message("user", format!("{}", i));
        }
        store.save_key("k").await.unwrap();
    }

    let mut small = store(&dir).with_max_messages(4);
    let conversation = small.get_or_create("k").await;
    assert_eq!(conversation.messages.len(), 4);
    assert_eq!(conversation.messages[0].content, "6");
}

#[tokio::test]
async fn test_idle_conversation_restarts_on_open() {
    let dir = TempDir::new().unwrap();
    let mut stale = Conversation::new("k");
    stale.add_message("user", "old question");
    stale.updated_at = Local::now() - Duration::minutes(90);

    let mut store = store(&dir).with_idle_expiry(60);
    store.save(&stale).await.unwrap();

    let conversation = store.get_or_create("k").await;
    assert!(conversation.is_fresh());
}

#[tokio::test]
async fn test_recent_conversation_survives_idle_check() {
    let dir = TempDir::new().unwrap();
    let mut store = store(&dir).with_idle_expiry(60);
    store.get_or_create("k").await.add_message("user", "hi");

    assert!(!store.get_or_create("k").await.is_fresh());
}

#[tokio::test]
async fn test_cache_evicts_least_recent() {
    let dir = TempDir::new().unwrap();
    let mut store = store(&dir).with_max_sessions(2);

    store.get_or_create("a").await.add_message("user", "1");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.get_or_create("b").await.add_message("user", "2");
    store.save_key("a").await.unwrap();

    store.get_or_create("c").await;
    assert_eq!(store.cached(), 2);

    // "a" was evicted from memory but still reloads from disk
    let a = store.get_or_create("a").await;
    assert_eq!(a.messages.len(), 1);
}

#[tokio::test]
async fn test_corrupt_file_starts_fresh() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    let mut store = store(&dir);
    assert!(store.get_or_create("broken").await.is_fresh());
}

#[tokio::test]
async fn test_list_and_delete() {
    let dir = TempDir::new().unwrap();
    let mut store = store(&dir);
    for key in ["cli:b", "cli:a"] {
        store.get_or_create(key).await.add_message("user", "x");
        store.save_key(key).await.unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    assert_eq!(store.list().await, vec!["cli:a".to_string(), "cli:b".to_string()]);

    assert!(store.delete("cli:a").await.unwrap());
    assert!(!store.delete("cli:a").await.unwrap());
    assert_eq!(store.list().await, vec!["cli:b".to_string()]);
}
