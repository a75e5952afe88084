//! Compiled pattern sets for the automated-sender and spam rules.

use regex::Regex;
use std::sync::LazyLock;

/// Addresses that are automation by construction.
pub static AUTOMATED_SENDERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(noreply|no-reply|donotreply|do-not-reply|newsletter|newsletters|marketing|notifications?|alerts?|updates?|mailer|bounce|postmaster|mailer-daemon|automated?)@",
    )
    .unwrap()
});

/// One entry per automated-content category; the label is surfaced in the
/// rejection reason.
pub static AUTOMATED_CONTENT: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (
            "OTP/verification",
            Regex::new(
                r"(?i)(verification code|one[- ]time password|\botp\b|security code|login code|2fa code|رمز التحقق|كود التفعيل|رمز الدخول|رمز التأكيد)",
            )
            .unwrap(),
        ),
        (
            "Marketing",
            Regex::new(
                r"(?i)(unsubscribe|special offer|flash sale|\d+% off|limited time offer|shop now|buy now|إلغاء الاشتراك|عرض خاص|تخفيضات|تسوق الآن)",
            )
            .unwrap(),
        ),
        (
            "Transactional",
            Regex::new(
                r"(?i)(order confirmation|your receipt|your invoice|payment received|shipping confirmation|تأكيد الطلب|فاتورتك|تم استلام الدفعة|تأكيد الشحن)",
            )
            .unwrap(),
        ),
        (
            "Security alert",
            Regex::new(
                r"(?i)(security alert|new sign[- ]?in|unusual activity|password was (changed|reset)|تنبيه أمني|تسجيل دخول جديد|نشاط غير معتاد)",
            )
            .unwrap(),
        ),
        (
            "Newsletter",
            Regex::new(r"(?i)(newsletter|weekly digest|monthly digest|النشرة البريدية|الملخص الأسبوعي)")
                .unwrap(),
        ),
        (
            "Policy update",
            Regex::new(
                r"(?i)(privacy policy|terms of service|policy update|سياسة الخصوصية|شروط الخدمة|تحديث السياسة)",
            )
            .unwrap(),
        ),
        (
            "Onboarding",
            Regex::new(
                r"(?i)(welcome to|getting started with|confirm your email|activate your account|مرحباً بك في|أكد بريدك|فعّل حسابك)",
            )
            .unwrap(),
        ),
        (
            "CI/DevOps",
            Regex::new(
                r"(?i)(build (failed|passed|succeeded)|pipeline #?\d*|deployment (started|finished|failed)|pull request|merge request|commit [0-9a-f]{7})",
            )
            .unwrap(),
        ),
    ]
});

/// Fixed bilingual spam keyword list; any hit contributes 2 points.
pub static SPAM_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(win money|free money|lottery|jackpot|click here now|get rich|crypto giveaway|اربح|مجانا|جائزة كبرى|ثروة سريعة|انقر هنا الآن)",
    )
    .unwrap()
});

pub static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").unwrap());

/// A body qualifies as a message at all only if it contains at least one
/// Latin or Arabic letter.
pub static HAS_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z\u{0600}-\u{06FF}]").unwrap());
