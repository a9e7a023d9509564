use std::collections::HashSet;
use std::sync::OnceLock;

/// Tokens shorter than this never become anchors.
pub const MIN_TOKEN_LEN: usize = 3;

/// Brazilian-Portuguese function words, stored already accent-folded so they
/// compare against the output of [`fold_char`].
pub const STOPWORDS: &[&str] = &[
    "a", "ao", "aos", "aquela", "aquelas", "aquele", "aqueles", "aquilo", "as", "ate",
    "com", "como", "da", "das", "de", "dela", "delas", "dele", "deles", "do", "dos", "e",
    "ela", "elas", "ele", "eles", "em", "entre", "era", "eram", "eramos", "essa", "essas",
    "esse", "esses", "esta", "estamos", "estao", "estas", "estava", "estavam", "estavamos",
    "fosse", "fossem", "fossemos", "ha", "haja", "hajam", "hajamos", "hao", "havia",
    "haviam", "haviamos", "hei", "houve", "houvemos", "houver", "houvera", "houveram",
    "houveramos", "houverei", "houverem", "houveremos", "houveria", "houveriam",
    "houveriamos", "houvermos", "houvesse", "houvessem", "houvessemos", "isso", "isto",
    "ja", "lhe", "lhes", "mais", "mas", "me", "mesmo", "meu", "meus", "minha", "minhas",
    "muito", "na", "nao", "nas", "nem", "no", "nos", "nossa", "nossas", "nosso", "nossos",
    "num", "numa", "o", "os", "ou", "para", "pela", "pelas", "pelo", "pelos", "por",
    "qual", "quando", "que", "quem", "se", "seja", "sejam", "sejamos", "sem", "ser",
    "sera", "serao", "serei", "seremos", "seria", "seriam", "seriamos", "seu", "seus",
    "so", "somos", "sou", "sua", "suas", "tambem", "te", "tem", "temos", "tenha", "tenham",
    "tenhamos", "tenho", "ter", "tera", "terao", "terei", "teremos", "teria", "teriam",
    "teriamos", "teu", "teus", "teve", "tinha", "tinham", "tinhamos", "tive", "tivemos",
    "tiver", "tivera", "tiveram", "tiveramos", "tiverem", "tivermos", "tivesse",
    "tivessem", "tivessemos", "tu", "tua", "tuas", "um", "uma", "voce", "voces", "vos",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

pub fn is_stopword(word: &str) -> bool {
    stopwords().contains(word)
}

/// Folds accented Latin vowels, `ç` and `ñ` to their ASCII base letter.
/// Expects lowercase input.
pub fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Lowercases and accent-folds `text`, keeping every other character as is.
pub fn fold(text: &str) -> String {
    text.to_lowercase().chars().map(fold_char).collect()
}

/// Reduces a raw phrase to a single canonical token.
///
/// The phrase is lowercased and accent-folded, every non-alphanumeric
/// character becomes a separator, and the first word that is at least
/// [`MIN_TOKEN_LEN`] long and not a stopword is returned. One phrase yields
/// at most one token; an empty string means nothing survived.
pub fn normalize(text: &str) -> String {
    let cleaned: String = fold(text)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .find(|word| word.len() >= MIN_TOKEN_LEN && !is_stopword(word))
        .map(str::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_first_surviving_token() {
        assert_eq!(normalize("CADEIRA rosa"), "cadeira");
        assert_eq!(normalize("a cadeira rosa"), "cadeira");
        assert_eq!(normalize("tecido com dinossauros"), "tecido");
    }

    #[test]
    fn folds_accents_and_punctuation() {
        assert_eq!(normalize("Cão!"), "cao");
        assert_eq!(normalize("...açaí"), "acai");
        assert_eq!(normalize("escritório"), "escritorio");
        assert_eq!(normalize("piña-colada"), "pina");
    }

    #[test]
    fn empty_and_short_inputs_vanish() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t "), "");
        assert_eq!(normalize("É"), "");
        assert_eq!(normalize("ok go"), "");
    }

    #[test]
    fn numbers_are_valid_tokens() {
        assert_eq!(normalize("2024"), "2024");
        assert_eq!(normalize("no 42 km"), "");
        assert_eq!(normalize("rua 123"), "rua");
    }

    #[test]
    fn every_stopword_normalizes_to_empty() {
        for word in STOPWORDS {
            assert_eq!(normalize(word), "", "stopword {word} survived");
        }
        assert_eq!(normalize("também"), "");
        assert_eq!(normalize("Você"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "CADEIRA rosa",
            "Praia de Copacabana!",
            "É",
            "  muito legal  ",
            "GUITARRA-elétrica",
            "123 456",
            "ñandú",
            "🐶 cachorro",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "input {sample:?}");
        }
    }
}
