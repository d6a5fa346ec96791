use tracing::debug;

use crate::bank_parsers::{
    komercijalna_parser, nlb_parser, stopanska_parser, BankParser, GenericCsvParser,
};

/// Ordered collection of bank parsers with a mandatory generic fallback in
/// last position. Detection is first-accept-wins over the registration
/// order, so when two banks could both claim a statement the earlier
/// registration takes it.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn BankParser>>,
}

impl ParserRegistry {
    /// Registration order: nlb, stopanska, komercijalna, then the fallback.
    pub fn new() -> Self {
        Self {
            parsers: vec![
                Box::new(nlb_parser()),
                Box::new(stopanska_parser()),
                Box::new(komercijalna_parser()),
                Box::new(GenericCsvParser),
            ],
        }
    }

    /// Adds a parser just before the generic fallback.
    pub fn register(&mut self, parser: Box<dyn BankParser>) {
        let idx = self.parsers.len().saturating_sub(1);
        self.parsers.insert(idx, parser);
    }

    /// Exact bank-code lookup; unknown codes get the generic fallback.
    pub fn by_bank_code(&self, bank_code: &str) -> &dyn BankParser {
        self.parsers
            .iter()
            .find(|p| p.bank_code() == bank_code)
            .map(|p| p.as_ref())
            .unwrap_or_else(|| self.generic())
    }

    /// First bank parser that accepts the content wins; the generic
    /// fallback answers when none do.
    pub fn detect(&self, content: &[u8]) -> &dyn BankParser {
        for parser in &self.parsers[..self.parsers.len() - 1] {
            if parser.can_parse(content) {
                debug!(bank = parser.bank_code(), "statement format detected");
                return parser.as_ref();
            }
        }
        debug!("no bank format matched, using generic parser");
        self.generic()
    }

    /// Bank codes and display names, fallback excluded.
    pub fn supported_banks(&self) -> Vec<(&'static str, &'static str)> {
        self.parsers[..self.parsers.len() - 1]
            .iter()
            .map(|p| (p.bank_code(), p.bank_name()))
            .collect()
    }

    fn generic(&self) -> &dyn BankParser {
        self.parsers
            .last()
            .map(|p| p.as_ref())
            .unwrap_or_else(|| unreachable!("registry always holds the generic parser"))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank_parsers::ParsedStatement;

    #[test]
    fn by_bank_code_falls_back_to_generic() {
        let registry = ParserRegistry::new();
        assert_eq!(registry.by_bank_code("nlb").bank_code(), "nlb");
        assert_eq!(registry.by_bank_code("stopanska").bank_code(), "stopanska");
        assert_eq!(registry.by_bank_code("komercijalna").bank_code(), "komercijalna");
        assert_eq!(registry.by_bank_code("unknown").bank_code(), "generic");
    }

    #[test]
    fn detect_prefers_registered_banks() {
        let registry = ParserRegistry::new();
        let nlb = "Датум;Износ;Валута;Опис;Референца\n15.01.2026;100,00;MKD;Уплата;R1\n";
        assert_eq!(registry.detect(nlb.as_bytes()).bank_code(), "nlb");

        let foreign = "col_a,col_b,col_c\n1,2,3\n";
        assert_eq!(registry.detect(foreign.as_bytes()).bank_code(), "generic");
    }

    #[test]
    fn supported_banks_excludes_generic() {
        let registry = ParserRegistry::new();
        let codes: Vec<_> = registry.supported_banks().iter().map(|(c, _)| *c).collect();
        assert_eq!(codes, vec!["nlb", "stopanska", "komercijalna"]);
    }

    #[test]
    fn registered_parser_slots_before_generic() {
        struct TestBank;
        impl BankParser for TestBank {
            fn bank_code(&self) -> &'static str {
                "testbank"
            }
            fn bank_name(&self) -> &'static str {
                "Test Bank"
            }
            fn delimiter(&self) -> u8 {
                b','
            }
            fn encoding(&self) -> &'static str {
                "utf-8"
            }
            fn can_parse(&self, content: &[u8]) -> bool {
                content.starts_with(b"TESTBANK")
            }
            fn parse(&self, _content: &[u8]) -> ParsedStatement {
                ParsedStatement::default()
            }
        }

        let mut registry = ParserRegistry::new();
        registry.register(Box::new(TestBank));
        assert_eq!(registry.detect(b"TESTBANK\nx,y\n").bank_code(), "testbank");
        let codes: Vec<_> = registry.supported_banks().iter().map(|(c, _)| *c).collect();
        assert_eq!(codes, vec!["nlb", "stopanska", "komercijalna", "testbank"]);
    }
}
