//! Outbound message bodies
//!
//! Plain-text templates for the billing and announcement mail paths.

use time::Date;

/// Renewal reminder: subscription expires within the lookahead window.
pub fn renewal_reminder(site: &str, username: &str, renewal_url: &str, expires: Date) -> (String, String) {
    let subject = format!("{site} Renewal");
    let body = format!(
        "Dear {username},\n\n\
         Your {site} subscription expires on {expires}.\n\
         To renew, visit:\n\n{renewal_url}\n\n\
         Thank you for your support!\n"
    );
    (subject, body)
}

/// The recurring charge for a renewal failed.
pub fn renewal_failed(site: &str, username: &str, support_url: &str, expires: Date) -> (String, String) {
    let subject = format!("{site} Subscription Update");
    let body = format!(
        "Dear {username},\n\n\
         We were unable to process the renewal charge for your {site} \
         subscription, which expires on {expires}.\n\
         Please update your payment details, or contact support:\n\n{support_url}\n"
    );
    (subject, body)
}

/// The card on file was declined.
pub fn card_declined(site: &str, username: &str, support_url: &str, expires: Date) -> (String, String) {
    let subject = format!("{site} Card Declined");
    let body = format!(
        "Dear {username},\n\n\
         Your card was declined when renewing your {site} subscription, \
         which expires on {expires}.\n\
         Please update your card, or contact support:\n\n{support_url}\n"
    );
    (subject, body)
}

/// New-post announcement for the content broadcast path.
pub fn post_announcement(site: &str, title: &str, rendered_text: &str) -> (String, String) {
    let subject = format!("New Update from {site}");
    let body = format!("{title}\n\n{rendered_text}\n");
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn reminder_includes_renewal_link_and_date() {
        let (subject, body) = renewal_reminder(
            "Example",
            "alice",
            "https://example.com/invoice?username=alice",
            date!(2026 - 09 - 01),
        );
        assert_eq!(subject, "Example Renewal");
        assert!(body.contains("alice"));
        assert!(body.contains("2026-09-01"));
        assert!(body.contains("https://example.com/invoice?username=alice"));
    }

    #[test]
    fn announcement_subject_names_the_site() {
        let (subject, body) = post_announcement("Example", "Big News", "The content.");
        assert_eq!(subject, "New Update from Example");
        assert!(body.starts_with("Big News"));
    }
}
