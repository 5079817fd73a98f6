use kmsprobe::{
    crc::{self, CrcSource, PipeCrc},
    debugfs::DebugFs,
};
use tracing::info;

use crate::harness::{Fixture, SubtestError};

const SAMPLES: usize = 3;

pub fn crc_stable(fixture: &mut Fixture) -> Result<(), SubtestError> {
    let debugfs = DebugFs::for_device(&*fixture.dev)?;
    crc::require_pipe_crc(&debugfs)?;
    crc::reset_all(&debugfs)?;

    let active = fixture.prepare_output()?;
    let fb = fixture.color_fb(active.size, (0.0, 1.0, 0.0))?;
    fixture.modeset(&active, &fb)?;

    let mut pipe_crc = PipeCrc::new(&debugfs, active.pipe, CrcSource::Auto)?;
    let reference = pipe_crc.collect_one()?;
    info!(pipe = %active.pipe, %reference, "reference CRC");

    pipe_crc.start()?;
    let crcs = (0..SAMPLES)
        .map(|_| pipe_crc.read_one())
        .collect::<Result<Vec<_>, _>>()?;
    pipe_crc.stop()?;
    for crc in &crcs {
        crc::assert_crc_equal(&reference, crc)?;
    }
    drop(pipe_crc);

    // a fresh session must agree as well
    let again = PipeCrc::new(&debugfs, active.pipe, CrcSource::Auto)?.collect_one()?;
    crc::assert_crc_equal(&reference, &again)?;
    Ok(())
}
