use super::types::{Lead, Template};

/// The enumerated placeholder set. Substitution is whole-token and
/// case-sensitive; anything else in double braces is left literal.
const PLACEHOLDERS: [&str; 3] = ["{{first_name}}", "{{company}}", "{{email}}"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body_html: String,
}

/// Substitute placeholders into subject and body and append the owning
/// user's signature. Subject values stay raw; values substituted into the
/// HTML body are entity-escaped.
pub fn render(template: &Template, lead: &Lead, signature_html: Option<&str>) -> RenderedEmail {
    let subject = substitute(&template.subject, lead, false);
    let mut body_html = substitute(&template.body_html, lead, true);

    if let Some(signature) = signature_html {
        if !signature.trim().is_empty() {
            body_html.push_str("<p></p>");
            body_html.push_str(signature);
        }
    }

    RenderedEmail { subject, body_html }
}

fn substitute(input: &str, lead: &Lead, escape: bool) -> String {
    let mut output = input.to_string();
    for token in PLACEHOLDERS {
        let raw = placeholder_value(token, lead);
        let value = if escape {
            escape_html(raw)
        } else {
            raw.to_string()
        };
        output = output.replace(token, &value);
    }
    output
}

fn placeholder_value<'a>(token: &str, lead: &'a Lead) -> &'a str {
    match token {
        "{{first_name}}" => lead.first_name.as_deref().unwrap_or(""),
        "{{company}}" => lead.company.as_deref().unwrap_or(""),
        "{{email}}" => lead.email.as_str(),
        _ => "",
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::types::LeadStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn lead(first_name: Option<&str>, company: Option<&str>) -> Lead {
        let now = Utc::now();
        Lead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            first_name: first_name.map(|value| value.to_string()),
            company: company.map(|value| value.to_string()),
            status: LeadStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn template(subject: &str, body: &str) -> Template {
        let now = Utc::now();
        Template {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            step_number: 1,
            subject: subject.to_string(),
            body_html: body.to_string(),
            delay_minutes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let rendered = render(
            &template("Hi {{first_name}}", "<p>Greetings from {{company}}</p>"),
            &lead(Some("Ada"), Some("Analytical Engines")),
            None,
        );
        assert_eq!(rendered.subject, "Hi Ada");
        assert_eq!(rendered.body_html, "<p>Greetings from Analytical Engines</p>");
    }

    #[test]
    fn empty_values_render_as_empty_string() {
        let rendered = render(
            &template("Hi {{first_name}}", "<p>{{company}}</p>"),
            &lead(None, None),
            None,
        );
        assert_eq!(rendered.subject, "Hi ");
        assert_eq!(rendered.body_html, "<p></p>");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let rendered = render(
            &template("{{last_name}}", "<p>{{ first_name }}</p>"),
            &lead(Some("Ada"), None),
            None,
        );
        assert_eq!(rendered.subject, "{{last_name}}");
        assert_eq!(rendered.body_html, "<p>{{ first_name }}</p>");
    }

    #[test]
    fn body_values_are_escaped_subject_values_are_not() {
        let rendered = render(
            &template("From {{company}}", "<p>{{company}}</p>"),
            &lead(None, Some("Ada & Sons <Ltd>")),
            None,
        );
        assert_eq!(rendered.subject, "From Ada & Sons <Ltd>");
        assert_eq!(rendered.body_html, "<p>Ada &amp; Sons &lt;Ltd&gt;</p>");
    }

    #[test]
    fn signature_appended_after_paragraph_separator() {
        let rendered = render(
            &template("Hello", "<p>Body</p>"),
            &lead(None, None),
            Some("<p>-- Ada</p>"),
        );
        assert_eq!(rendered.body_html, "<p>Body</p><p></p><p>-- Ada</p>");
    }

    #[test]
    fn blank_signature_is_ignored() {
        let rendered = render(&template("Hello", "<p>Body</p>"), &lead(None, None), Some("  "));
        assert_eq!(rendered.body_html, "<p>Body</p>");
    }
}
