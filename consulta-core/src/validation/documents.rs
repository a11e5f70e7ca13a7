//! Brazilian identifiers: check digits and masking.

const CNPJ_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const RENAVAM_WEIGHTS: [u32; 10] = [3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

fn digits(raw: &str) -> Option<Vec<u32>> {
    raw.chars().map(|ch| ch.to_digit(10)).collect()
}

fn all_same(values: &[u32]) -> bool {
    values.windows(2).all(|pair| pair.first() == pair.get(1))
}

fn mod11_times_ten(sum: u32) -> u32 {
    match (sum * 10) % 11 {
        10 => 0,
        rest => rest,
    }
}

/// Whether `raw` is an 11 digit CPF with valid check digits.
#[must_use]
pub fn is_valid_cpf(raw: &str) -> bool {
    let Some(values) = digits(raw) else {
        return false;
    };
    if values.len() != 11 || all_same(&values) {
        return false;
    }

    [(9_usize, 10_u32), (10, 11)].iter().all(|&(position, top_weight)| {
        let sum: u32 = values
            .iter()
            .take(position)
            .zip((2..=top_weight).rev())
            .map(|(digit, weight)| digit * weight)
            .sum();
        values.get(position) == Some(&mod11_times_ten(sum))
    })
}

/// Whether `raw` is a 14 digit CNPJ with valid check digits.
#[must_use]
pub fn is_valid_cnpj(raw: &str) -> bool {
    let Some(values) = digits(raw) else {
        return false;
    };
    if values.len() != 14 || all_same(&values) {
        return false;
    }

    [12_usize, 13].iter().all(|&position| {
        let weights = CNPJ_WEIGHTS.iter().skip(13 - position);
        let sum: u32 = values
            .iter()
            .take(position)
            .zip(weights)
            .map(|(digit, weight)| digit * weight)
            .sum();
        let check = match sum % 11 {
            0 | 1 => 0,
            rest => 11 - rest,
        };
        values.get(position) == Some(&check)
    })
}

/// Whether `raw` is a CPF or a CNPJ.
#[must_use]
pub fn is_valid_document(raw: &str) -> bool {
    is_valid_cpf(raw) || is_valid_cnpj(raw)
}

/// Whether `raw` is an 11 digit RENAVAM with a valid check digit.
#[must_use]
pub fn is_valid_renavam(raw: &str) -> bool {
    let Some(values) = digits(raw) else {
        return false;
    };
    if values.len() != 11 {
        return false;
    }

    let sum: u32 = values
        .iter()
        .zip(RENAVAM_WEIGHTS)
        .map(|(digit, weight)| digit * weight)
        .sum();
    values.get(10) == Some(&mod11_times_ten(sum))
}

/// Mask a CPF, CNPJ, or other registry number, keeping only the middle digits.
#[must_use]
pub fn mask_document(raw: &str) -> String {
    let numbers: String = raw.chars().filter(char::is_ascii_digit).collect();
    let middle = |skip: usize, take: usize| numbers.chars().skip(skip).take(take).collect::<String>();

    match numbers.len() {
        11 => format!("***.{}.{}-**", middle(3, 3), middle(6, 3)),
        14 => format!("**.{}.{}/****-**", middle(2, 3), middle(5, 3)),
        _ => mask_tail(raw, 3),
    }
}

/// Mask a licence plate, keeping the three letters.
#[must_use]
pub fn mask_plate(raw: &str) -> String {
    mask_tail(raw, 3)
}

/// Mask a phone number, keeping its last four digits.
#[must_use]
pub fn mask_phone(raw: &str) -> String {
    let numbers: Vec<char> = raw.chars().filter(char::is_ascii_digit).collect();
    let hidden = numbers.len().saturating_sub(4);
    numbers
        .iter()
        .enumerate()
        .map(|(index, digit)| if index < hidden { '*' } else { *digit })
        .collect()
}

fn mask_tail(raw: &str, keep: usize) -> String {
    raw.chars()
        .enumerate()
        .map(|(index, ch)| {
            if index < keep || !ch.is_ascii_alphanumeric() {
                ch
            } else {
                '*'
            }
        })
        .collect()
}
