//! English pluralisation for default table names (`user` -> `users`).

const UNCOUNTABLE: &[&str] = &[
    "equipment",
    "information",
    "rice",
    "money",
    "species",
    "series",
    "fish",
    "sheep",
    "jeans",
    "police",
    "news",
];

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("child", "children"),
    ("sex", "sexes"),
    ("move", "moves"),
    ("ox", "oxen"),
    ("mouse", "mice"),
    ("louse", "lice"),
];

/// Suffix rules, first match wins: (suffix, chars to drop, replacement).
const SUFFIX_RULES: &[(&str, usize, &str)] = &[
    ("quiz", 0, "zes"),
    ("matrix", 2, "ices"),
    ("vertex", 2, "ices"),
    ("index", 2, "ices"),
    ("alias", 0, "es"),
    ("status", 0, "es"),
    ("octopus", 2, "i"),
    ("virus", 2, "i"),
    ("axis", 2, "es"),
    ("testis", 2, "es"),
    ("buffalo", 0, "es"),
    ("tomato", 0, "es"),
    ("bus", 0, "es"),
    ("hive", 0, "s"),
    ("sis", 2, "es"),
    ("ium", 2, "a"),
    ("tum", 2, "a"),
    ("ss", 0, "es"),
    ("sh", 0, "es"),
    ("ch", 0, "es"),
    ("x", 0, "es"),
    ("ta", 0, ""),
    ("ia", 0, ""),
];

/// Plural form of a snake_case name; only the last word is inflected.
pub fn pluralize(name: &str) -> String {
    let (head, word) = match name.rfind('_') {
        Some(pos) => name.split_at(pos + 1),
        None => ("", name),
    };
    if word.is_empty() {
        return name.to_string();
    }
    let lower = word.to_ascii_lowercase();
    format!("{head}{}", pluralize_word(word, &lower))
}

fn pluralize_word(word: &str, lower: &str) -> String {
    if UNCOUNTABLE.contains(&lower) {
        return word.to_string();
    }
    for (singular, plural) in IRREGULAR {
        if lower == *singular {
            return plural.to_string();
        }
        if lower == *plural {
            return word.to_string();
        }
    }
    for (suffix, drop, replacement) in SUFFIX_RULES {
        if lower.ends_with(suffix) {
            let keep = word.len() - drop;
            return format!("{}{replacement}", &word[..keep]);
        }
    }

    let bytes = lower.as_bytes();
    let n = bytes.len();
    if lower.ends_with('y') && n >= 2 && !b"aeiou".contains(&bytes[n - 2]) {
        return format!("{}ies", &word[..n - 1]);
    }
    if lower.ends_with("fe") && n >= 3 && bytes[n - 3] != b'f' {
        return format!("{}ves", &word[..n - 2]);
    }
    if (lower.ends_with("lf") || lower.ends_with("rf")) && n >= 2 {
        return format!("{}ves", &word[..n - 1]);
    }
    if lower.ends_with('s') {
        return word.to_string();
    }
    format!("{word}s")
}
