use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::DispatchContext;

static OPT_OUT_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:unsubscribe|opt[\s-]?out|do\s+not\s+(?:contact|text|message|call)|don'?t\s+(?:contact|text|message|call)\s+me|stop\s+(?:texting|messaging|contacting|calling)|remove\s+me\s+from|cancel\s+(?:all\s+|these\s+|the\s+|my\s+)?(?:texts|messages|notifications|subscription))\b",
    )
    .expect("opt-out pattern compiles")
});

static AGGRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:idiot|stupid|moron|pathetic|shut\s+up|you\s+people|last\s+warning|or\s+else|we\s+will\s+make\s+you|how\s+dare\s+you)\b",
    )
    .expect("aggression pattern compiles")
});

// "cancel" only counts inside a phrase such as "cancel these texts".
const OPT_OUT_KEYWORDS: [&str; 5] = ["stop", "stopall", "unsubscribe", "end", "quit"];
const OPT_OUT_FLAGS: [&str; 3] = ["opted_out", "do_not_contact", "unsubscribed"];

/// Whether the event shows the customer does not want to be contacted.
pub(crate) fn opt_out_signal(context: &DispatchContext) -> bool {
    let flagged = OPT_OUT_FLAGS.iter().any(|flag| {
        context.metadata(flag).is_some_and(|value| {
            value.as_bool().unwrap_or(false)
                || value
                    .as_str()
                    .is_some_and(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
        })
    });
    if flagged {
        return true;
    }
    let bare: String = context
        .input
        .message
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_lowercase();
    OPT_OUT_KEYWORDS.contains(&bare.as_str()) || OPT_OUT_PHRASE.is_match(&context.input.message)
}

/// Whether the text uses hostile phrasing.
pub(crate) fn aggressive(text: &str) -> bool {
    AGGRESSION.is_match(text)
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether the text repeats itself like spam.
pub(crate) fn spam_like(text: &str) -> bool {
    let words = words(text);
    let mut run = 1;
    for pair in words.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            if run >= 4 {
                return true;
            }
        } else {
            run = 1;
        }
    }
    if words.len() >= 12 {
        let unique: std::collections::HashSet<&String> = words.iter().collect();
        #[allow(clippy::cast_precision_loss)]
        let ratio = unique.len() as f64 / words.len() as f64;
        return ratio < 0.3;
    }
    false
}

/// Whether the text shouts: mostly capitals or stacked exclamation marks.
pub(crate) fn shouting(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    #[allow(clippy::cast_precision_loss)]
    let mostly_caps = letters.len() >= 20 && upper as f64 / letters.len() as f64 > 0.7;
    mostly_caps || text.contains("!!!")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Trigger;
    use serde_json::json;

    fn context(message: &str) -> DispatchContext {
        DispatchContext::builder(Trigger::MessageReceived, "t")
            .message(message)
            .build()
    }

    #[test]
    fn recognizes_opt_out() {
        assert!(opt_out_signal(&context("STOP")));
        assert!(opt_out_signal(&context("  stop. ")));
        assert!(opt_out_signal(&context("please stop texting me")));
        assert!(opt_out_signal(&context("Don't contact me again")));
        assert!(!opt_out_signal(&context("can I stop by at 3?")));

        let flagged = DispatchContext::builder(Trigger::CustomerInactive, "t")
            .metadata("do_not_contact", json!(true))
            .build();
        assert!(opt_out_signal(&flagged));
    }

    #[test]
    fn cancel_alone_is_not_an_opt_out() {
        assert!(!opt_out_signal(&context("Cancel")));
        assert!(!opt_out_signal(&context("I need to cancel my appointment")));
        assert!(!opt_out_signal(&context("cancel.")));
        assert!(opt_out_signal(&context("please cancel these texts")));
        assert!(opt_out_signal(&context("Cancel my subscription")));
    }

    #[test]
    fn flags_tone() {
        assert!(aggressive("Pay now, this is your last warning"));
        assert!(!aggressive("Friendly reminder about tomorrow"));
        assert!(spam_like("book book book book now"));
        assert!(spam_like(
            "deal deal now now deal now deal deal now now deal now deal now"
        ));
        assert!(!spam_like("See you tomorrow at 10am, reply here if anything changes."));
        assert!(shouting("YOUR APPOINTMENT IS TOMORROW DO NOT BE LATE"));
        assert!(shouting("See you soon!!!"));
        assert!(!shouting("See you soon!"));
    }
}
