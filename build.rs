use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Convert a PNG image to 8-bit grey pixels at build time
fn convert_image_to_grey(
    input_path: &str,
    output_path: &str,
    target_width: u32,
    target_height: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed={}", input_path);

    // Check if input file exists
    if !Path::new(input_path).exists() {
        println!("cargo:warning=Image file '{}' not found, skipping conversion", input_path);
        // Create empty file so build doesn't fail
        File::create(output_path)?;
        return Ok(());
    }

    let img = image::open(input_path)?;

    // Fit inside the panel, preserving the aspect ratio
    let orig_ratio = img.width() as f32 / img.height() as f32;
    let target_ratio = target_width as f32 / target_height as f32;
    let (new_width, new_height) = if orig_ratio > target_ratio {
        (target_width, (target_width as f32 / orig_ratio) as u32)
    } else {
        ((target_height as f32 * orig_ratio) as u32, target_height)
    };
    let gray = img
        .resize(new_width, new_height, image::imageops::FilterType::Lanczos3)
        .to_luma8();

    // Centered on a white background, one byte per pixel
    let offset_x = (target_width - new_width) / 2;
    let offset_y = (target_height - new_height) / 2;
    let mut buffer = vec![0xFFu8; (target_width * target_height) as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        let index = ((y + offset_y) * target_width + x + offset_x) as usize;
        buffer[index] = pixel[0];
    }

    let mut file = File::create(output_path)?;
    file.write_all(&buffer)?;
    println!(
        "cargo:warning=Splash image {}x{} saved to: {}",
        new_width, new_height, output_path
    );
    Ok(())
}

fn main() {
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => dir,
        Err(e) => panic!("OUT_DIR not set: {}", e),
    };

    // Panel dimensions: 800x600 landscape
    let splash_output = format!("{}/splash.bin", out_dir);
    if let Err(e) = convert_image_to_grey("splash.png", &splash_output, 800, 600) {
        println!("cargo:warning=Failed to convert splash.png: {}", e);
        // the binary embeds whatever is there, an empty file means no splash
        if let Err(e) = File::create(&splash_output) {
            panic!("cannot write {}: {}", splash_output, e);
        }
    }

    println!("cargo:rerun-if-changed=splash.png");
}
