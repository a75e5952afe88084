//! Ordered filter chain applied to every inbound message before persistence.
//!
//! Every rule is a pure function of its inputs; side effects (persistence,
//! dedup cache, logging) stay in the ingestion scheduler. Rules run in a
//! fixed order and short-circuit on the first rejection.

mod patterns;
mod rules;

pub use rules::{apply_filters, is_blocked_sender_keyword, FilterPolicy, RecentMessage, Verdict};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rasil_core::types::{Channel, NormalizedMessage};

    fn msg(body: &str, contact: &str, subject: Option<&str>) -> NormalizedMessage {
        NormalizedMessage {
            channel: Channel::Email,
            channel_message_id: Some("m".into()),
            sender_id: None,
            sender_contact: Some(contact.into()),
            sender_name: None,
            subject: subject.map(String::from),
            body: body.into(),
            received_at: Some(Utc::now().naive_utc()),
            attachments: Vec::new(),
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        }
    }

    fn pass(m: &NormalizedMessage) -> bool {
        matches!(
            apply_filters(m, &FilterPolicy::default(), &[], Utc::now().naive_utc()),
            Verdict::Pass
        )
    }

    fn reason(m: &NormalizedMessage) -> String {
        match apply_filters(m, &FilterPolicy::default(), &[], Utc::now().naive_utc()) {
            Verdict::Reject(r) => r,
            Verdict::Pass => panic!("expected rejection"),
        }
    }

    #[test]
    fn ordinary_arabic_message_passes() {
        assert!(pass(&msg("مرحباً، أريد الاستفسار عن الأسعار", "customer@example.com", None)));
    }

    #[test]
    fn ordinary_english_message_passes() {
        assert!(pass(&msg("Hi, I'd like to know more about your product", "jane@example.com", None)));
    }

    #[test]
    fn too_short_body_is_empty() {
        assert!(reason(&msg("hi", "a@b.com", None)).contains("Empty"));
    }

    #[test]
    fn body_without_letters_is_empty() {
        assert!(reason(&msg("12345 678", "a@b.com", None)).contains("Empty"));
    }

    #[test]
    fn noreply_sender_is_rejected_with_sender_pattern() {
        let m = msg("Hello, just checking in.", "noreply@company.com", Some("Hello"));
        assert!(reason(&m).contains("Sender pattern"));
    }

    #[test]
    fn newsletter_sender_is_rejected() {
        let m = msg("Some content here", "newsletter@example.com", Some("Updates"));
        assert!(reason(&m).contains("Sender pattern"));
    }

    #[test]
    fn english_otp_is_rejected() {
        let m = msg("Your verification code is 123456", "random@bank.com", Some("Security Code"));
        assert!(reason(&m).contains("OTP"));
    }

    #[test]
    fn arabic_otp_is_rejected() {
        let m = msg("رمز التحقق الخاص بك هو 5678", "info@service.com", Some("كود التفعيل"));
        assert!(reason(&m).contains("OTP"));
    }

    #[test]
    fn unsubscribe_marketing_is_rejected() {
        let m = msg(
            "Great deals! Click here to unsubscribe if not interested.",
            "deals@shop.com",
            Some("Special Deals"),
        );
        assert!(reason(&m).contains("Marketing"));
    }

    #[test]
    fn spam_score_rejects_keyword_plus_urls() {
        let body = "اربح الآن جوائز مجانا http://a.co http://b.co http://c.co http://d.co";
        let m = msg(body, "x@y.com", None);
        assert!(reason(&m).contains("Spam"));
    }

    #[test]
    fn duplicate_within_window_is_rejected() {
        let now = Utc::now().naive_utc();
        let m = msg("نفس الرسالة تماماً مكررة", "+963912345678", None);
        let recent = vec![RecentMessage {
            sender_contact: Some("+963912345678".into()),
            body: "نفس الرسالة تماماً مكررة".into(),
            received_at: Some(now - chrono::Duration::minutes(2)),
        }];
        match apply_filters(&m, &FilterPolicy::default(), &recent, now) {
            Verdict::Reject(r) => assert!(r.contains("Duplicate")),
            Verdict::Pass => panic!("expected duplicate rejection"),
        }
    }

    #[test]
    fn same_body_outside_window_passes() {
        let now = Utc::now().naive_utc();
        let m = msg("نفس الرسالة تماماً مكررة", "+963912345678", None);
        let recent = vec![RecentMessage {
            sender_contact: Some("+963912345678".into()),
            body: "نفس الرسالة تماماً مكررة".into(),
            received_at: Some(now - chrono::Duration::minutes(30)),
        }];
        assert!(matches!(
            apply_filters(&m, &FilterPolicy::default(), &recent, now),
            Verdict::Pass
        ));
    }

    #[test]
    fn per_license_blocked_sender_wins() {
        let m = msg("رسالة عادية تماماً", "banned@example.com", None);
        let policy = FilterPolicy {
            blocked_senders: vec!["banned@example.com".into()],
            ..Default::default()
        };
        match apply_filters(&m, &policy, &[], Utc::now().naive_utc()) {
            Verdict::Reject(r) => assert!(r.contains("Blocked sender")),
            Verdict::Pass => panic!("expected blocked sender"),
        }
    }

    #[test]
    fn per_license_keyword_block_wins() {
        let m = msg("هذه رسالة عن التسويق الشبكي", "x@y.com", None);
        let policy = FilterPolicy {
            blocked_keywords: vec!["التسويق الشبكي".into()],
            ..Default::default()
        };
        match apply_filters(&m, &policy, &[], Utc::now().naive_utc()) {
            Verdict::Reject(r) => assert!(r.contains("Blocked keyword")),
            Verdict::Pass => panic!("expected keyword block"),
        }
    }

    #[test]
    fn filters_are_pure_repeat_calls_agree() {
        let m = msg("مرحباً، سؤال عن المنتج", "a@b.com", None);
        let now = Utc::now().naive_utc();
        let first = matches!(apply_filters(&m, &FilterPolicy::default(), &[], now), Verdict::Pass);
        for _ in 0..10 {
            let again =
                matches!(apply_filters(&m, &FilterPolicy::default(), &[], now), Verdict::Pass);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn save_time_bot_keywords_match() {
        assert!(is_blocked_sender_keyword(Some("MyCompanyBot"), None));
        assert!(is_blocked_sender_keyword(None, Some("noreply@x.com")));
        assert!(is_blocked_sender_keyword(None, Some("hello@calendly.com")));
        assert!(!is_blocked_sender_keyword(Some("Ahmad"), Some("+963912345678")));
    }
}
