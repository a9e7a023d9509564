use std::collections::HashSet;

/// Character bigrams of every whitespace-delimited word, lowercased.
/// Single-character words contribute nothing.
pub fn bigrams(text: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    for word in text.to_lowercase().split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        for pair in chars.windows(2) {
            set.insert(pair.iter().collect());
        }
    }
    set
}

/// `|a ∩ b| / |a ∪ b|`, or 0 when both sets are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Highest bigram-Jaccard similarity between `candidate` and any prior message.
pub fn repetition_score<S: AsRef<str>>(candidate: &str, priors: &[S]) -> f64 {
    if priors.is_empty() {
        return 0.0;
    }
    let candidate = bigrams(candidate);
    priors
        .iter()
        .map(|prior| jaccard(&candidate, &bigrams(prior.as_ref())))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bigrams_per_word() {
        let expected: HashSet<String> = ["ga", "at", "to", "sa"].into_iter().map(String::from).collect();
        assert_eq!(bigrams("GATO a sa"), expected);
        assert!(bigrams("").is_empty());
        assert!(bigrams("a b c").is_empty());
    }

    #[test]
    fn bigrams_respect_multibyte_chars() {
        let expected: HashSet<String> = ["nã", "ão"].into_iter().map(String::from).collect();
        assert_eq!(bigrams("não"), expected);
    }

    #[test]
    fn no_priors_scores_zero() {
        assert_eq!(repetition_score::<&str>("qualquer coisa", &[]), 0.0);
    }

    #[test]
    fn empty_sets_do_not_divide_by_zero() {
        assert_eq!(repetition_score("", &[""]), 0.0);
        assert_eq!(repetition_score("", &["praia linda"]), 0.0);
    }

    #[test]
    fn near_duplicates_score_high() {
        let score = repetition_score("que praia incrivel hoje", &["que praia incrivel ontem"]);
        assert!(score > 0.5, "score was {score}");
        assert_eq!(repetition_score("Mesma Frase", &["mesma frase"]), 1.0);
    }

    #[test]
    fn takes_maximum_over_priors() {
        let priors = ["nada a ver com isso", "que praia incrivel ontem"];
        let best = repetition_score("que praia incrivel hoje", &priors);
        let single = repetition_score("que praia incrivel hoje", &priors[1..]);
        assert_eq!(best, single);
    }

    #[test]
    fn score_is_symmetric() {
        let pairs = [
            ("adorei o violão", "que violão bonito"),
            ("praia", "praia de copacabana"),
            ("", "algo"),
        ];
        for (a, b) in pairs {
            assert_eq!(repetition_score(a, &[b]), repetition_score(b, &[a]));
        }
    }
}
