use crate::mpy48sr;

/// Maximum number of queued buttons
const QUEUE_LIMIT: usize = 20;

/// Oscillator coefficients for 697/770/852/941 Hz (rows) and
/// 1209/1336/1477/1633 Hz (columns)
const ROW_COEFFS: [i16; 4] = [27980, 26956, 25701, 24218];
const COLUMN_COEFFS: [i16; 4] = [19073, 16325, 13085, 9315];

fn button_coeffs(button: char) -> Option<(i16, i16)> {
    let (row, column) = match button {
        '1' => (0, 0),
        '2' => (0, 1),
        '3' => (0, 2),
        'A' => (0, 3),
        '4' => (1, 0),
        '5' => (1, 1),
        '6' => (1, 2),
        'B' => (1, 3),
        '7' => (2, 0),
        '8' => (2, 1),
        '9' => (2, 2),
        'C' => (2, 3),
        '*' => (3, 0),
        '0' => (3, 1),
        '#' => (3, 2),
        'D' => (3, 3),
        _ => return None,
    };
    Some((ROW_COEFFS[row], COLUMN_COEFFS[column]))
}

/// Dual recursive oscillator producing DTMF key presses frame by frame.
///
/// Each queued button is rendered as `push_ms` of dual tone followed by
/// `pause_ms` of silence; [`generate`](Self::generate) fills one frame
/// per call and keeps emitting silence once the queue is drained.
pub struct DtmfGenerator {
    frame_size: usize,
    push_frames: u32,
    pause_frames: u32,

    push_left: u32,
    pause_left: u32,

    queue: Vec<char>,
    position: usize,
    remaining: usize,
    idle: bool,

    coeff_row: i16,
    coeff_column: i16,
    y1_row: i64,
    y1_column: i64,
    y2_row: i64,
    y2_column: i64,
}

impl DtmfGenerator {
    pub fn new(frame_size: usize, push_ms: u32, pause_ms: u32) -> Self {
        Self {
            frame_size,
            push_frames: (push_ms << 3) / frame_size as u32 + 1,
            pause_frames: (pause_ms << 3) / frame_size as u32 + 1,
            push_left: 0,
            pause_left: 0,
            queue: Vec::with_capacity(QUEUE_LIMIT),
            position: 0,
            remaining: 0,
            idle: true,
            coeff_row: 0,
            coeff_column: 0,
            y1_row: 0,
            y1_column: 0,
            y2_row: 0,
            y2_column: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Queue buttons for generation. Refused while a previous queue is
    /// still being rendered.
    pub fn queue(&mut self, buttons: &[char]) -> bool {
        if !self.idle {
            return false;
        }
        if buttons.is_empty() {
            self.reset();
            return true;
        }

        self.queue.clear();
        self.queue
            .extend(buttons.iter().copied().take(QUEUE_LIMIT));
        self.remaining = self.queue.len();
        self.position = 0;
        self.push_left = self.push_frames;
        self.pause_left = self.pause_frames;
        self.idle = false;
        true
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.remaining = 0;
        self.position = 0;
        self.idle = true;
    }

    /// Fill `frame` with the next `frame_size` samples
    pub fn generate(&mut self, frame: &mut [i16]) {
        debug_assert_eq!(frame.len(), self.frame_size);

        if self.idle {
            frame.fill(0);
            return;
        }

        while self.remaining > 0 {
            if self.push_left == self.push_frames {
                self.engage(self.queue[self.position]);
            }

            if self.push_left > 0 {
                self.push_left -= 1;
                self.oscillate(frame);
                return;
            }

            if self.pause_left > 0 {
                self.pause_left -= 1;
                frame.fill(0);
                return;
            }

            self.push_left = self.push_frames;
            self.pause_left = self.pause_frames;
            self.position += 1;
            self.remaining -= 1;
        }

        self.idle = true;
        frame.fill(0);
    }

    fn engage(&mut self, button: char) {
        if let Some((row, column)) = button_coeffs(button) {
            self.coeff_row = row;
            self.coeff_column = column;
            self.y1_row = i64::from(row);
            self.y2_row = 31000;
            self.y1_column = i64::from(column);
            self.y2_column = 31000;
        } else {
            self.coeff_row = 0;
            self.coeff_column = 0;
            self.y1_row = 0;
            self.y2_row = 0;
            self.y1_column = 0;
            self.y2_column = 0;
        }
    }

    fn oscillate(&mut self, frame: &mut [i16]) {
        let mut y1_0 = self.y1_row;
        let mut y1_1 = self.y1_column;
        let mut y2_0 = self.y2_row;
        let mut y2_1 = self.y2_column;

        let dual = self.coeff_row != 0 && self.coeff_column != 0;

        for sample in frame.iter_mut() {
            let t0 = mpy48sr(self.coeff_row, y1_0 << 1) - y2_0;
            let t1 = mpy48sr(self.coeff_column, y1_1 << 1) - y2_1;

            y2_0 = y1_0;
            y2_1 = y1_1;
            y1_0 = t0;
            y1_1 = t1;

            let mut out = t0 + t1;
            if dual {
                out >>= 1;
            }
            *sample = out as i16;
        }

        self.y1_row = y1_0;
        self.y1_column = y1_1;
        self.y2_row = y2_0;
        self.y2_column = y2_1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_refused_while_busy() {
        let mut generator = DtmfGenerator::new(160, 100, 50);
        assert!(generator.queue(&['1']));
        assert!(!generator.queue(&['2']));
    }

    #[test]
    fn tone_then_pause_then_idle() {
        let mut generator = DtmfGenerator::new(160, 40, 20);
        assert!(generator.queue(&['5']));

        let mut frame = [0i16; 160];

        // 40ms at 160-sample frames is 3 tone frames (rounded up)
        generator.generate(&mut frame);
        assert!(frame.iter().any(|&s| s != 0));

        let mut saw_pause = false;
        for _ in 0..16 {
            generator.generate(&mut frame);
            if frame.iter().all(|&s| s == 0) {
                saw_pause = true;
            }
            if generator.is_idle() {
                break;
            }
        }

        assert!(saw_pause);
        assert!(generator.is_idle());
    }
}
