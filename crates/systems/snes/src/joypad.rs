//! Controller port 1 wiring.

use framestep_core::{Button, InputVector};

/// Serial bit order of the standard controller, MSB first.
const SERIAL_ORDER: [Button; 12] = [
    Button::B,
    Button::Y,
    Button::Select,
    Button::Start,
    Button::Up,
    Button::Down,
    Button::Left,
    Button::Right,
    Button::A,
    Button::X,
    Button::L,
    Button::R,
];

/// Pack the held buttons into the 16-bit word the console reads from
/// `$4218/$4219` (and shifts out of `$4016`). The low four bits are the
/// controller signature and stay zero.
pub fn pad_word(input: InputVector) -> u16 {
    SERIAL_ORDER
        .iter()
        .enumerate()
        .filter(|(_, &button)| input.is_pressed(button))
        .fold(0, |word, (i, _)| word | (0x8000 >> i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(pad_word(InputVector::empty()), 0);
    }

    #[test]
    fn buttons_land_on_hardware_bits() {
        assert_eq!(pad_word(Button::B.into()), 0x8000);
        assert_eq!(pad_word(Button::Right.into()), 0x0100);
        assert_eq!(pad_word(Button::A.into()), 0x0080);
        assert_eq!(pad_word(Button::R.into()), 0x0010);
        let all: InputVector = Button::ALL.into_iter().collect();
        assert_eq!(pad_word(all), 0xFFF0);
    }
}
