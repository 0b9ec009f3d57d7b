use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use image::DynamicImage;
use minanime_core::{
    derive_output_path, AdapterAttachment, ConversionParams, StyleConverter, SynthesisRequest,
    Synthesizer, SEED,
};

struct CountingSynthesizer {
    calls: Rc<RefCell<Vec<SynthesisRequest>>>,
}

impl Synthesizer for CountingSynthesizer {
    fn adapter_attachment(&self) -> AdapterAttachment {
        AdapterAttachment::Adapted
    }

    fn synthesize(&mut self, request: SynthesisRequest) -> Result<DynamicImage> {
        let image = request.image.clone();
        self.calls.borrow_mut().push(request);
        Ok(image)
    }
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("minanime-e2e-{tag}-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_photo(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::from_pixel(width, height, image::Rgb([200, 150, 90]))
        .save(&path)
        .unwrap();
    path
}

#[test]
fn default_run_matches_the_documented_contract() {
    let dir = scratch_dir("contract");
    let input = write_photo(&dir, "photo.jpg", 1024, 768);

    let calls = Rc::new(RefCell::new(Vec::new()));
    let factory_calls = Rc::clone(&calls);
    let mut converter = StyleConverter::new(move || -> Result<CountingSynthesizer> {
        Ok(CountingSynthesizer {
            calls: Rc::clone(&factory_calls),
        })
    });

    let output = converter
        .convert(&input, None, &ConversionParams::default())
        .unwrap();

    assert_eq!(output, dir.join("photo_minimalist.jpg"));
    let saved = image::open(&output).unwrap();
    assert_eq!((saved.width(), saved.height()), (768, 576));

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert_eq!(request.strength, 0.75);
    assert_eq!(request.guidance_scale, 7.5);
    assert_eq!(request.num_steps, 20);
    assert_eq!(request.seed, SEED);
    assert_eq!((request.image.width(), request.image.height()), (768, 576));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn batch_loop_isolates_per_item_failures() {
    let dir = scratch_dir("batch");
    let input_dir = dir.join("input");
    let output_dir = dir.join("output");
    fs::create_dir_all(&input_dir).unwrap();
    fs::create_dir_all(&output_dir).unwrap();

    write_photo(&input_dir, "a.jpg", 64, 48);
    write_photo(&input_dir, "b.png", 48, 64);
    write_photo(&input_dir, "c.jpg", 32, 32);
    // Not an image at all; decoding it must fail.
    fs::write(input_dir.join("broken.jpg"), b"not an image").unwrap();

    let calls = Rc::new(RefCell::new(Vec::new()));
    let factory_calls = Rc::clone(&calls);
    let mut converter = StyleConverter::new(move || -> Result<CountingSynthesizer> {
        Ok(CountingSynthesizer {
            calls: Rc::clone(&factory_calls),
        })
    });

    let mut inputs: Vec<PathBuf> = fs::read_dir(&input_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    inputs.sort();

    let mut converted = 0;
    let mut failed = 0;
    for input in &inputs {
        let output = output_dir.join(
            derive_output_path(input)
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default(),
        );
        match converter.convert(input, Some(&output), &ConversionParams::default()) {
            Ok(_) => converted += 1,
            Err(_) => failed += 1,
        }
    }

    assert_eq!(converted, 3);
    assert_eq!(failed, 1);
    assert_eq!(fs::read_dir(&output_dir).unwrap().count(), 3);

    fs::remove_dir_all(&dir).unwrap();
}
