use chrono::Utc;
use shared::domain::UserId;
use storage::{NewMessage, Storage};

fn file_url(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("chat.db");
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

async fn register(storage: &Storage, name: &str) -> UserId {
    storage
        .create_user(name, &format!("{name}@example.com"), "hash")
        .await
        .expect("create user")
}

#[tokio::test]
async fn message_to_offline_user_survives_restart_and_reads_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = file_url(&dir);

    let (alice, bob, sent) = {
        let storage = Storage::new(&url).await.expect("open");
        let alice = register(&storage, "alice").await;
        let bob = register(&storage, "bob").await;
        storage
            .set_presence(alice, true, Utc::now())
            .await
            .expect("alice online");
        let sent = storage
            .insert_message(NewMessage::text(alice, bob, "  hi  "))
            .await
            .expect("insert");
        (alice, bob, sent)
    };

    let storage = Storage::new(&url).await.expect("reopen");
    assert_eq!(storage.reset_presence().await.expect("reset"), 1);

    let (messages, has_more) = storage.conversation(bob, alice, 1, 50).await.expect("fetch");
    assert!(!has_more);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, sent);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[0].sender.id, alice);
    assert!(!messages[0].read);

    let recent = storage.recent_conversations(bob).await.expect("recent");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].partner.id, alice);
    assert_eq!(recent[0].unread_count, 1);

    assert_eq!(storage.mark_read_from(alice, bob).await.expect("mark"), 1);
    assert_eq!(storage.mark_read_from(alice, bob).await.expect("mark again"), 0);
    let (messages, _) = storage.conversation(alice, bob, 1, 50).await.expect("fetch");
    assert!(messages.iter().all(|message| message.read));
}

#[tokio::test]
async fn second_reaction_from_same_user_replaces_the_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::new(&file_url(&dir)).await.expect("open");
    let alice = register(&storage, "alice").await;
    let bob = register(&storage, "bob").await;
    let message = storage
        .insert_message(NewMessage::text(alice, bob, "lunch?"))
        .await
        .expect("insert");

    storage.upsert_reaction(message, bob, "👍").await.expect("react");
    storage.upsert_reaction(message, bob, "🎉").await.expect("react again");
    storage.upsert_reaction(message, alice, "😀").await.expect("react");

    let stored = storage
        .message_by_id(message)
        .await
        .expect("lookup")
        .expect("message exists");
    let mut reactions: Vec<_> = stored
        .reactions
        .iter()
        .map(|reaction| (reaction.user_id, reaction.emoji.as_str()))
        .collect();
    reactions.sort_by_key(|(user, _)| user.0);
    assert_eq!(reactions, vec![(alice, "😀"), (bob, "🎉")]);
}
