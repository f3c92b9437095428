use crate::modules::archive::email::{email_dedup_key, Email};
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{insert_impl, secondary_find_impl, transactional_impl};
use crate::modules::error::code::ErrorCode;
use crate::raise_error;
use crate::utc_now;

fn sample_email(mailbox_id: u64, message_id: &str) -> Email {
    Email {
        id: crate::id!(64),
        mailbox_id,
        dedup_key: email_dedup_key(mailbox_id, message_id),
        message_id: message_id.to_string(),
        subject: "subject".into(),
        sent_at: utc_now!(),
        created_at: utc_now!(),
        updated_at: utc_now!(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_unique_secondary_key_rejects_duplicates() {
    let mailbox_id = 990_001;
    insert_impl(DB_MANAGER.meta_db(), sample_email(mailbox_id, "<a@x>"))
        .await
        .unwrap();
    let result = insert_impl(DB_MANAGER.meta_db(), sample_email(mailbox_id, "<a@x>")).await;
    assert!(result.is_err());

    let found = secondary_find_impl::<Email>(
        DB_MANAGER.meta_db(),
        crate::modules::archive::email::EmailKey::dedup_key,
        email_dedup_key(mailbox_id, "<a@x>"),
    )
    .await
    .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn test_transactional_impl_rolls_back_on_error() {
    let mailbox_id = 990_002;
    let email = sample_email(mailbox_id, "<rollback@x>");
    let result: Result<(), _> = transactional_impl(DB_MANAGER.meta_db(), move |rw| {
        rw.insert(email)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        Err(raise_error!("forced failure".into(), ErrorCode::InternalError))
    })
    .await;
    assert!(result.is_err());

    let found = secondary_find_impl::<Email>(
        DB_MANAGER.meta_db(),
        crate::modules::archive::email::EmailKey::dedup_key,
        email_dedup_key(mailbox_id, "<rollback@x>"),
    )
    .await
    .unwrap();
    assert!(found.is_none());
}
