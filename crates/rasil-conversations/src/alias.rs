//! Sender-alias resolution. A telegram peer may appear as `+<phone>`,
//! `<username>`, `tg:<numeric>` or `<numeric>`; every alias-scoped query
//! must union over the whole set.

use rasil_core::types::LicenseId;
use rasil_store::inbox::AliasSet;
use rasil_store::{Database, Result, Value};

/// Expansion passes. One pass covers the common phone↔username case; the
/// cap keeps pathological data from looping.
const MAX_EXPANSIONS: usize = 3;

/// Compute the alias set for one contact by union-querying past messages.
pub async fn resolve_alias_set(
    db: &Database,
    license_id: LicenseId,
    sender_contact: &str,
) -> Result<AliasSet> {
    let mut contacts: Vec<String> = vec![sender_contact.to_string()];
    let mut ids: Vec<String> = Vec::new();

    // `tg:<id>` and bare numeric contacts double as sender ids.
    if let Some(stripped) = sender_contact.strip_prefix("tg:") {
        push_unique(&mut ids, stripped);
    }
    if sender_contact.chars().all(|c| c.is_ascii_digit()) && !sender_contact.is_empty() {
        push_unique(&mut ids, sender_contact);
    }

    for _ in 0..MAX_EXPANSIONS {
        let before = (contacts.len(), ids.len());

        let set = AliasSet {
            contacts: contacts.clone(),
            sender_ids: ids.clone(),
        };
        let mut params: Vec<Value> = vec![license_id.into()];
        let cond = set.sql_condition(&mut params);
        let rows = db
            .fetch_all(
                &format!(
                    "SELECT DISTINCT sender_contact, sender_id FROM inbox_messages
                     WHERE license_key_id = ? AND {cond}"
                ),
                &params,
            )
            .await?;

        for row in &rows {
            if let Some(contact) = row.opt_text("sender_contact")? {
                if !contact.is_empty() {
                    push_unique(&mut contacts, &contact);
                    if let Some(stripped) = contact.strip_prefix("tg:") {
                        push_unique(&mut ids, stripped);
                    }
                }
            }
            if let Some(id) = row.opt_text("sender_id")? {
                if !id.is_empty() {
                    push_unique(&mut ids, &id);
                }
            }
        }

        if (contacts.len(), ids.len()) == before {
            break;
        }
    }

    Ok(AliasSet {
        contacts,
        sender_ids: ids,
    })
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasil_core::types::{Channel, NormalizedMessage};
    use rasil_store::inbox::save_inbox_message;
    use rasil_store::schema::init_schema;

    fn msg(id: &str, contact: &str, sender_id: Option<&str>) -> NormalizedMessage {
        NormalizedMessage {
            channel: Channel::Telegram,
            channel_message_id: Some(id.into()),
            sender_id: sender_id.map(String::from),
            sender_contact: Some(contact.into()),
            sender_name: None,
            subject: None,
            body: "مرحبا".into(),
            received_at: None,
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        }
    }

    #[tokio::test]
    async fn phone_and_username_unify_through_sender_id() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        save_inbox_message(&db, 1, &msg("m1", "+963912345678", Some("5551234")))
            .await
            .unwrap();
        // Different contact string, same numeric sender — canonicalization
        // rewrites the stored contact, but the id linkage must also resolve.
        save_inbox_message(&db, 1, &msg("m2", "@someuser", Some("5551234")))
            .await
            .unwrap();

        let set = resolve_alias_set(&db, 1, "+963912345678").await.unwrap();
        assert!(set.contacts.contains(&"+963912345678".to_string()));
        assert!(set.sender_ids.contains(&"5551234".to_string()));
    }

    #[tokio::test]
    async fn tg_prefix_and_numeric_contacts_count_as_ids() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        let set = resolve_alias_set(&db, 1, "tg:42").await.unwrap();
        assert!(set.sender_ids.contains(&"42".to_string()));

        let set = resolve_alias_set(&db, 1, "12345").await.unwrap();
        assert!(set.sender_ids.contains(&"12345".to_string()));
    }

    #[tokio::test]
    async fn unknown_contact_resolves_to_itself() {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();

        let set = resolve_alias_set(&db, 1, "stranger@example.com").await.unwrap();
        assert_eq!(set.contacts, vec!["stranger@example.com".to_string()]);
        assert!(set.sender_ids.is_empty());
    }
}
