use super::*;

async fn storage_with_pair() -> (Storage, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice", "alice@example.com", "hash")
        .await
        .expect("alice");
    let bob = storage
        .create_user("bob", "bob@example.com", "hash")
        .await
        .expect("bob");
    (storage, alice, bob)
}

fn validation_error(err: &anyhow::Error) -> Option<MessageValidationError> {
    err.downcast_ref::<MessageValidationError>().copied()
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn looks_up_users_by_id_email_and_username() {
    let (storage, alice, bob) = storage_with_pair().await;

    let by_id = storage.user_by_id(alice).await.expect("query").expect("user");
    assert_eq!(by_id.username, "alice");
    assert!(!by_id.is_online);
    assert!(by_id.last_seen.is_none());

    let by_email = storage
        .user_by_email("BOB@example.com")
        .await
        .expect("query")
        .expect("user");
    assert_eq!(by_email.id, bob);

    assert!(storage
        .user_by_username("carol")
        .await
        .expect("query")
        .is_none());

    let listed = storage.users_by_ids(&[bob, alice]).await.expect("users");
    let names: Vec<_> = listed.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);
    assert!(storage.users_by_ids(&[]).await.expect("empty").is_empty());
}

#[tokio::test]
async fn duplicate_username_is_rejected() {
    let (storage, _alice, _bob) = storage_with_pair().await;
    let err = storage
        .create_user("alice", "other@example.com", "hash")
        .await
        .expect_err("duplicate");
    assert!(validation_error(&err).is_none());
}

#[tokio::test]
async fn presence_flags_are_updated_and_reset() {
    let (storage, alice, bob) = storage_with_pair().await;
    let now = Utc::now();
    storage.set_presence(alice, true, now).await.expect("online");
    storage.set_presence(bob, true, now).await.expect("online");

    let alice_row = storage.user_by_id(alice).await.expect("query").expect("user");
    assert!(alice_row.is_online);
    assert!(alice_row.last_seen.is_some());

    let reset = storage.reset_presence().await.expect("reset");
    assert_eq!(reset, 2);
    let users = storage.list_users().await.expect("users");
    assert!(users.iter().all(|u| !u.is_online));
}

#[tokio::test]
async fn insert_message_trims_and_populates_sender() {
    let (storage, alice, bob) = storage_with_pair().await;
    let id = storage
        .insert_message(NewMessage::text(alice, bob, "  hi there  "))
        .await
        .expect("insert");

    let message = storage
        .message_by_id(id)
        .await
        .expect("query")
        .expect("message");
    assert_eq!(message.content, "hi there");
    assert_eq!(message.sender.id, alice);
    assert_eq!(message.sender.username, "alice");
    assert_eq!(message.receiver_id, bob);
    assert!(!message.read);
    assert!(!message.edited);
}

#[tokio::test]
async fn text_message_without_content_is_rejected() {
    let (storage, alice, bob) = storage_with_pair().await;
    let err = storage
        .insert_message(NewMessage::text(alice, bob, "   "))
        .await
        .expect_err("empty text");
    assert_eq!(validation_error(&err), Some(MessageValidationError::EmptyText));

    let (messages, _) = storage.conversation(alice, bob, 1, 50).await.expect("history");
    assert!(messages.is_empty());
}

#[tokio::test]
async fn image_message_requires_url() {
    let (storage, alice, bob) = storage_with_pair().await;
    let mut message = NewMessage::text(alice, bob, "");
    message.kind = MessageKind::Image;
    let err = storage
        .insert_message(message.clone())
        .await
        .expect_err("missing url");
    assert_eq!(
        validation_error(&err),
        Some(MessageValidationError::MissingImageUrl)
    );

    message.image = Some(ImageAttachment {
        url: "https://cdn.example/cat.png".into(),
        public_id: "cat".into(),
        width: 320,
        height: 200,
    });
    let id = storage.insert_message(message).await.expect("image");
    let stored = storage
        .message_by_id(id)
        .await
        .expect("query")
        .expect("message");
    assert_eq!(stored.message_type, MessageKind::Image);
    assert_eq!(stored.image.expect("image").width, 320);
}

#[tokio::test]
async fn overlong_content_is_rejected() {
    let (storage, alice, bob) = storage_with_pair().await;
    let content = "x".repeat(MAX_CONTENT_CHARS + 1);
    let err = storage
        .insert_message(NewMessage::text(alice, bob, content))
        .await
        .expect_err("too long");
    assert_eq!(
        validation_error(&err),
        Some(MessageValidationError::ContentTooLong)
    );
}

#[tokio::test]
async fn conversation_returns_newest_page_oldest_first() {
    let (storage, alice, bob) = storage_with_pair().await;
    for i in 0..5 {
        let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
        storage
            .insert_message(NewMessage::text(from, to, format!("m{i}")))
            .await
            .expect("insert");
    }

    let (page, has_more) = storage.conversation(bob, alice, 1, 3).await.expect("page");
    let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m2", "m3", "m4"]);
    assert!(has_more);

    let (older, has_more) = storage.conversation(alice, bob, 2, 3).await.expect("page");
    let contents: Vec<_> = older.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1"]);
    assert!(!has_more);
}

#[tokio::test]
async fn room_messages_are_separate_from_direct_conversations() {
    let (storage, alice, bob) = storage_with_pair().await;
    let mut room_message = NewMessage::text(alice, UserId(bob.0), "to the room");
    room_message.receiver_kind = ReceiverKind::Room;
    storage.insert_message(room_message).await.expect("room");

    let (direct, _) = storage.conversation(alice, bob, 1, 50).await.expect("direct");
    assert!(direct.is_empty());
    let (room, _) = storage
        .room_messages(RoomId(bob.0), 1, 50)
        .await
        .expect("room");
    assert_eq!(room.len(), 1);
    assert_eq!(room[0].receiver_kind, ReceiverKind::Room);
}

#[tokio::test]
async fn mark_read_from_is_idempotent() {
    let (storage, alice, bob) = storage_with_pair().await;
    for content in ["one", "two"] {
        storage
            .insert_message(NewMessage::text(alice, bob, content))
            .await
            .expect("insert");
    }
    storage
        .insert_message(NewMessage::text(bob, alice, "reply"))
        .await
        .expect("insert");

    assert_eq!(storage.mark_read_from(alice, bob).await.expect("first"), 2);
    assert_eq!(storage.mark_read_from(alice, bob).await.expect("second"), 0);

    let (messages, _) = storage.conversation(alice, bob, 1, 50).await.expect("history");
    for message in messages {
        let expected = message.sender.id == alice;
        assert_eq!(message.read, expected, "message {}", message.content);
    }
}

#[tokio::test]
async fn mark_read_ids_only_touches_messages_addressed_to_reader() {
    let (storage, alice, bob) = storage_with_pair().await;
    let to_bob = storage
        .insert_message(NewMessage::text(alice, bob, "for bob"))
        .await
        .expect("insert");
    let to_alice = storage
        .insert_message(NewMessage::text(bob, alice, "for alice"))
        .await
        .expect("insert");

    let updated = storage
        .mark_read_ids(&[to_bob, to_alice], bob)
        .await
        .expect("mark");
    assert_eq!(updated, 1);
    assert_eq!(storage.mark_read_ids(&[], bob).await.expect("empty"), 0);
}

#[tokio::test]
async fn recent_conversations_report_last_message_and_unread() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice", "a@example.com", "h")
        .await
        .expect("user");
    let bob = storage
        .create_user("bob", "b@example.com", "h")
        .await
        .expect("user");
    let carol = storage
        .create_user("carol", "c@example.com", "h")
        .await
        .expect("user");

    storage
        .insert_message(NewMessage::text(bob, alice, "hey alice"))
        .await
        .expect("insert");
    storage
        .insert_message(NewMessage::text(bob, alice, "still there?"))
        .await
        .expect("insert");
    storage
        .insert_message(NewMessage::text(alice, carol, "hi carol"))
        .await
        .expect("insert");

    let recent = storage.recent_conversations(alice).await.expect("recent");
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].partner.id, carol);
    assert_eq!(recent[0].unread_count, 0);
    assert_eq!(recent[1].partner.id, bob);
    assert_eq!(recent[1].last_message.content, "still there?");
    assert_eq!(recent[1].unread_count, 2);
}

#[tokio::test]
async fn second_reaction_from_same_user_replaces_first() {
    let (storage, alice, bob) = storage_with_pair().await;
    let id = storage
        .insert_message(NewMessage::text(alice, bob, "react to me"))
        .await
        .expect("insert");

    storage.upsert_reaction(id, bob, "👍").await.expect("react");
    storage.upsert_reaction(id, bob, "🎉").await.expect("react");
    storage.upsert_reaction(id, alice, "👍").await.expect("react");

    let message = storage.message_by_id(id).await.expect("query").expect("message");
    assert_eq!(message.reactions.len(), 2);
    let bob_reaction = message
        .reactions
        .iter()
        .find(|r| r.user_id == bob)
        .expect("bob reaction");
    assert_eq!(bob_reaction.emoji, "🎉");

    assert!(storage.remove_reaction(id, bob).await.expect("remove"));
    assert!(!storage.remove_reaction(id, bob).await.expect("remove again"));

    let err = storage
        .upsert_reaction(id, bob, "not an emoji")
        .await
        .expect_err("too long");
    assert_eq!(validation_error(&err), Some(MessageValidationError::InvalidEmoji));
}

#[tokio::test]
async fn edit_appends_previous_content_to_history() {
    let (storage, alice, bob) = storage_with_pair().await;
    let id = storage
        .insert_message(NewMessage::text(alice, bob, "first"))
        .await
        .expect("insert");

    assert!(storage.edit_message(id, "second").await.expect("edit"));
    assert!(storage.edit_message(id, " third ").await.expect("edit"));

    let message = storage.message_by_id(id).await.expect("query").expect("message");
    assert_eq!(message.content, "third");
    assert!(message.edited);
    let history: Vec<_> = message
        .edit_history
        .iter()
        .map(|e| e.content.as_str())
        .collect();
    assert_eq!(history, vec!["first", "second"]);

    let err = storage.edit_message(id, "  ").await.expect_err("empty edit");
    assert_eq!(validation_error(&err), Some(MessageValidationError::EmptyText));
    assert!(!storage
        .edit_message(MessageId(9_999), "ghost")
        .await
        .expect("missing"));
}

#[tokio::test]
async fn deleting_message_removes_reactions() {
    let (storage, alice, bob) = storage_with_pair().await;
    let id = storage
        .insert_message(NewMessage::text(alice, bob, "bye"))
        .await
        .expect("insert");
    storage.upsert_reaction(id, bob, "👋").await.expect("react");

    assert!(storage.delete_message(id).await.expect("delete"));
    assert!(storage.message_by_id(id).await.expect("query").is_none());
    assert!(!storage.delete_message(id).await.expect("delete again"));
}

#[test]
fn sqlite_path_ignores_memory_and_non_sqlite_urls() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert!(sqlite_path("postgres://localhost/db").is_none());
    assert_eq!(
        sqlite_path("sqlite://data/chat.db?mode=rwc"),
        Some(PathBuf::from("data/chat.db"))
    );
}
